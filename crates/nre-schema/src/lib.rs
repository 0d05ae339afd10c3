// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema cache and compiled schema descriptors.
//!
//! Remote stores describe every collection with a JSON Schema. This crate
//! fetches those documents (archive directory first, then HTTP), flattens
//! `allOf` inheritance into a [`SchemaClass`] with a field list and defaults,
//! and compiles a [`Validator`] used at commit time.

mod cache;
mod class;
mod error;
mod validator;

pub use cache::{archive_file_name, SchemaCache};
pub use class::{FieldKind, FieldSpec, SchemaClass};
pub use error::{SchemaError, ValidationError, Violation};
pub use validator::Validator;

/// Strip a trailing empty fragment so `http://x/node#` and `http://x/node`
/// name the same schema.
pub fn canonical_uri(uri: &str) -> &str {
    uri.strip_suffix('#').unwrap_or(uri)
}

/// Split `base#fragment`, returning `(base, fragment)` with the `#` removed.
pub(crate) fn split_fragment(uri: &str) -> (&str, &str) {
    match uri.split_once('#') {
        Some((base, frag)) => (base, frag),
        None => (uri, ""),
    }
}

/// Resolve `reference` against `base`, falling back to the raw reference
/// when either side is not an absolute URL.
pub(crate) fn resolve_uri(base: &str, reference: &str) -> String {
    if reference.starts_with('#') {
        return format!("{}{reference}", split_fragment(base).0);
    }
    match url::Url::parse(base).and_then(|b| b.join(reference)) {
        Ok(joined) => joined.to_string(),
        Err(_) => reference.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn canonical_uri_drops_empty_fragment() {
        assert_eq!(canonical_uri("http://x/schema/node#"), "http://x/schema/node");
        assert_eq!(canonical_uri("http://x/schema/node"), "http://x/schema/node");
    }

    #[test]
    fn resolve_uri_handles_local_and_relative_refs() {
        assert_eq!(
            resolve_uri("http://x/schema/node#", "#/definitions/a"),
            "http://x/schema/node#/definitions/a"
        );
        assert_eq!(
            resolve_uri("http://x/schema/node", "port#"),
            "http://x/schema/port#"
        );
        assert_eq!(
            resolve_uri("http://x/schema/node", "http://y/other"),
            "http://y/other"
        );
    }
}
