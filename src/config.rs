//! Host-wide configuration (spec.md §6's `MAX_FLAT_RESULTS`/asyncify
//! defaults, bundled into one plain-data struct — spec.md "Configuration").

/// Tunables shared by the dispatcher, host binder, and scheduler. This is
/// a library, not a CLI: there is no file-based config format, only this
/// struct and its [`Default`] impl.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostConfig {
    /// The flat-slot boundary between a direct return and a
    /// return-pointer ("indirect") return (spec.md §6 `MAX_FLAT_RESULTS`).
    pub max_flat_results: usize,
    /// Guest linear-memory address of the Asyncify unwind/rewind data
    /// structure (spec.md §6).
    pub asyncify_data_addr: u32,
    /// Size in bytes reserved for the Asyncify stack buffer, starting
    /// just past `asyncify_data_addr`'s 8-byte header (spec.md §6).
    pub asyncify_stack_size: u32,
    /// Prefix applied to every `tracing` span this crate opens, so an
    /// embedding host can filter this crate's diagnostics independently
    /// of its own.
    pub tracing_span_prefix: &'static str,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            max_flat_results: 1,
            asyncify_data_addr: 16,
            asyncify_stack_size: 1024,
            tracing_span_prefix: "witty_abi",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = HostConfig::default();
        assert_eq!(config.max_flat_results, 1);
        assert_eq!(config.asyncify_data_addr, 16);
        assert_eq!(config.asyncify_stack_size, 1024);
    }
}
