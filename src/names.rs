//! Name resolution (spec.md §6): semver-aware `namespace@X.Y.Z` matching,
//! and the kebab-case ⇄ bracketed-WIT transforms for method/static/
//! constructor/resource-drop names. Authored directly from spec.md §6 —
//! no file in the retrieval pack implements this.

use crate::error::{AbiError, AbiResult};

/// Resource names made of more than one kebab word, recognized as a
/// closed allow-list so greedy splitting doesn't cut a resource name in
/// the wrong place (spec.md §6: "`method-outgoing-response-body` splits
/// as `outgoing-response.body`, not `outgoing.response-body`").
pub const MULTI_WORD_RESOURCE_NAMES: &[&str] = &[
    "outgoing-response",
    "incoming-response",
    "outgoing-request",
    "incoming-request",
    "input-stream",
    "output-stream",
    "error-context",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// Splits `namespace@X.Y.Z` into its base path and optional version.
pub fn parse_namespace(namespace: &str) -> (&str, Option<SemVer>) {
    match namespace.split_once('@') {
        Some((base, version)) => match parse_semver(version) {
            Some(semver) => (base, Some(semver)),
            None => (namespace, None),
        },
        None => (namespace, None),
    }
}

fn parse_semver(version: &str) -> Option<SemVer> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(SemVer { major, minor, patch })
}

/// `true` when a host registered at `registered` satisfies a guest import
/// declared as `imported` (spec.md §6: "base paths match, majors match,
/// minors match, and `W ≤ Z`; exact match is tried first").
pub fn namespace_satisfies(registered: &str, imported: &str) -> bool {
    if registered == imported {
        return true;
    }
    let (registered_base, registered_version) = parse_namespace(registered);
    let (imported_base, imported_version) = parse_namespace(imported);
    if registered_base != imported_base {
        return false;
    }
    match (registered_version, imported_version) {
        (Some(registered), Some(imported)) => {
            registered.major == imported.major
                && registered.minor == imported.minor
                && imported.patch <= registered.patch
        }
        (None, None) => true,
        _ => false,
    }
}

/// Converts a kebab-case export name to its bracketed WIT form:
/// `method-R-fn` → `[method]R.fn`, `static-R-fn` → `[static]R.fn`,
/// `constructor-R` → `[constructor]R`, `resource-drop-R` →
/// `[resource-drop]R` (spec.md §6).
pub fn kebab_to_bracketed(name: &str) -> AbiResult<String> {
    if let Some(rest) = name.strip_prefix("constructor-") {
        return Ok(format!("[constructor]{rest}"));
    }
    if let Some(rest) = name.strip_prefix("resource-drop-") {
        return Ok(format!("[resource-drop]{rest}"));
    }
    for (prefix, tag) in [("method-", "method"), ("static-", "static")] {
        if let Some(rest) = name.strip_prefix(prefix) {
            let (resource, method) = split_resource_and_method(rest)?;
            return Ok(format!("[{tag}]{resource}.{method}"));
        }
    }
    Err(AbiError::invalid(format!(
        "`{name}` is not a recognized method/static/constructor/resource-drop export name"
    )))
}

/// The inverse of [`kebab_to_bracketed`].
pub fn bracketed_to_kebab(name: &str) -> AbiResult<String> {
    if let Some(rest) = name.strip_prefix("[constructor]") {
        return Ok(format!("constructor-{rest}"));
    }
    if let Some(rest) = name.strip_prefix("[resource-drop]") {
        return Ok(format!("resource-drop-{rest}"));
    }
    for (tag, prefix) in [("[method]", "method-"), ("[static]", "static-")] {
        if let Some(rest) = name.strip_prefix(tag) {
            let (resource, method) = rest
                .split_once('.')
                .ok_or_else(|| AbiError::invalid(format!("`{name}` is missing a `.` before the method name")))?;
            return Ok(format!("{prefix}{resource}-{method}"));
        }
    }
    Err(AbiError::invalid(format!(
        "`{name}` is not a recognized bracketed WIT export name"
    )))
}

/// Splits `method-R-fn`'s `R-fn` remainder into `(R, fn)`, preferring the
/// longest [`MULTI_WORD_RESOURCE_NAMES`] match over a greedy first-word
/// split.
fn split_resource_and_method(remainder: &str) -> AbiResult<(String, String)> {
    for resource in MULTI_WORD_RESOURCE_NAMES {
        if let Some(method) = remainder
            .strip_prefix(*resource)
            .and_then(|rest| rest.strip_prefix('-'))
        {
            return Ok((resource.to_string(), method.to_string()));
        }
    }
    remainder
        .split_once('-')
        .map(|(resource, method)| (resource.to_string(), method.to_string()))
        .ok_or_else(|| {
            AbiError::invalid(format!(
                "`{remainder}` has no `-` separating a resource name from its method"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_satisfies_requires_matching_major_and_minor() {
        assert!(namespace_satisfies("wasi:io@0.2.3", "wasi:io@0.2.1"));
        assert!(!namespace_satisfies("wasi:io@0.2.3", "wasi:io@0.2.4"));
        assert!(!namespace_satisfies("wasi:io@0.3.0", "wasi:io@0.2.1"));
        assert!(!namespace_satisfies("wasi:io@0.2.3", "wasi:http@0.2.1"));
    }

    #[test]
    fn namespace_satisfies_tries_exact_match_first() {
        assert!(namespace_satisfies("wasi:io", "wasi:io"));
        assert!(!namespace_satisfies("wasi:io", "wasi:io@0.2.0"));
    }

    #[test]
    fn kebab_bracketed_round_trip_for_each_form() {
        assert_eq!(kebab_to_bracketed("constructor-pollable").unwrap(), "[constructor]pollable");
        assert_eq!(kebab_to_bracketed("resource-drop-pollable").unwrap(), "[resource-drop]pollable");
        assert_eq!(kebab_to_bracketed("method-pollable-ready").unwrap(), "[method]pollable.ready");
        assert_eq!(kebab_to_bracketed("static-pollable-poll").unwrap(), "[static]pollable.poll");

        assert_eq!(bracketed_to_kebab("[constructor]pollable").unwrap(), "constructor-pollable");
        assert_eq!(bracketed_to_kebab("[method]pollable.ready").unwrap(), "method-pollable-ready");
    }

    #[test]
    fn multi_word_resource_names_split_correctly() {
        assert_eq!(
            kebab_to_bracketed("method-outgoing-response-body").unwrap(),
            "[method]outgoing-response.body"
        );
        // Without the allow-list, a greedy first-word split would produce
        // `outgoing.response-body` instead.
        assert_ne!(
            kebab_to_bracketed("method-outgoing-response-body").unwrap(),
            "[method]outgoing.response-body"
        );
    }
}
