//! Canon definitions (spec.md §1: "semver-aware name resolution, kebab↔WIT
//! transforms, WASI shims and telemetry remain interfaces the crate
//! consumes rather than implements in full"). This module is data-only: a
//! small registry an external component front end populates, describing
//! which exports lift/lower which WIT shapes, so the dispatcher/binder
//! can look a function up by name without depending on the front end's
//! own types.

use crate::wit_type::WitTypeDef;

/// Describes one exported function's signature as the canonical-ABI
/// transcoder needs to see it: its WIT parameter and result types. The
/// binary parsing that produces this is out of scope (spec.md §1).
#[derive(Clone, Debug, PartialEq)]
pub struct LiftDef {
    pub export_name: String,
    pub param_types: Vec<WitTypeDef>,
    pub result_types: Vec<WitTypeDef>,
}

/// Describes one host-function import's signature the same way, for the
/// lowering (host → guest) direction.
#[derive(Clone, Debug, PartialEq)]
pub struct LowerDef {
    pub namespace: String,
    pub import_name: String,
    pub param_types: Vec<WitTypeDef>,
    pub result_types: Vec<WitTypeDef>,
}

/// A flat table of [`LiftDef`]/[`LowerDef`] entries, keyed by name.
/// Construction is entirely the caller's responsibility — this crate
/// never parses a component binary to populate one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanonRegistry {
    lifts: Vec<LiftDef>,
    lowers: Vec<LowerDef>,
}

impl CanonRegistry {
    pub fn new() -> Self {
        CanonRegistry::default()
    }

    pub fn with_lift(mut self, lift: LiftDef) -> Self {
        self.lifts.push(lift);
        self
    }

    pub fn with_lower(mut self, lower: LowerDef) -> Self {
        self.lowers.push(lower);
        self
    }

    pub fn find_lift(&self, export_name: &str) -> Option<&LiftDef> {
        self.lifts.iter().find(|lift| lift.export_name == export_name)
    }

    pub fn find_lower(&self, namespace: &str, import_name: &str) -> Option<&LowerDef> {
        self.lowers.iter().find(|lower| {
            lower.import_name == import_name && crate::names::namespace_satisfies(&lower.namespace, namespace)
        })
    }

    pub fn all_lifts(&self) -> &[LiftDef] {
        &self.lifts
    }

    pub fn all_lowers(&self) -> &[LowerDef] {
        &self.lowers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_lift_looks_up_by_export_name() {
        let registry = CanonRegistry::new().with_lift(LiftDef {
            export_name: "echo-list-s32".to_string(),
            param_types: vec![WitTypeDef::list(WitTypeDef::S32)],
            result_types: vec![WitTypeDef::list(WitTypeDef::S32)],
        });
        assert!(registry.find_lift("echo-list-s32").is_some());
        assert!(registry.find_lift("missing").is_none());
    }

    #[test]
    fn find_lower_respects_namespace_version_satisfaction() {
        let registry = CanonRegistry::new().with_lower(LowerDef {
            namespace: "wasi:io@0.2.3".to_string(),
            import_name: "log".to_string(),
            param_types: vec![WitTypeDef::String],
            result_types: vec![],
        });
        assert!(registry.find_lower("wasi:io@0.2.1", "log").is_some());
        assert!(registry.find_lower("wasi:io@0.3.0", "log").is_none());
    }
}
