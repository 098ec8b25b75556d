//! Identifier safety for generated SQL names
//!
//! PostgreSQL silently truncates identifiers to 63 bytes (`NAMEDATALEN - 1`)
//! and folds unquoted identifiers to lowercase. Constraint and index names we
//! generate must be byte-identical to what the backend itself would have
//! produced for deployments that predate this normalization, otherwise
//! "does this constraint already exist" catalog probes stop matching.
//!
//! All generated identifiers pass through this module; nothing derived from a
//! caller-controlled string is ever interpolated into DDL directly.

/// Maximum identifier length accepted by the backend, in UTF-8 bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Truncate `name` to at most `max_bytes` UTF-8 bytes.
///
/// The result is a byte-exact prefix of the input. When the byte cut point
/// falls inside a multi-byte character, the cut walks backward to the nearest
/// whole-character boundary rather than emitting a split code point. Names
/// already within budget (including the empty string) are returned unchanged.
pub fn truncate_identifier(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut cut = max_bytes;
    while cut > 0 && !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

/// Inputs for [`build_constraint_name`].
#[derive(Debug, Clone, Default)]
pub struct ConstraintName<'a> {
    /// Base constraint name, e.g. `"engram_messages_id_unique"`
    pub base: &'a str,
    /// Optional schema namespace prefixed as `schema_` before truncation
    pub schema: Option<&'a str>,
    /// Byte budget override; defaults to [`MAX_IDENTIFIER_BYTES`]
    pub max_bytes: Option<usize>,
}

/// Build the constraint name the backend would report for this table.
///
/// Unquoted identifiers are folded to lowercase by the backend, so the result
/// is lowercased; when a schema namespace is present it is prefixed as
/// `schema_base` *before* truncating, so long schema names truncate exactly
/// the way the backend silently truncated them for pre-existing deployments.
/// With no schema this is the identity transform modulo lowercasing.
pub fn build_constraint_name(spec: ConstraintName<'_>) -> String {
    let max = spec.max_bytes.unwrap_or(MAX_IDENTIFIER_BYTES);
    let full = match spec.schema {
        Some(schema) if !schema.is_empty() => format!("{}_{}", schema, spec.base),
        _ => spec.base.to_string(),
    };
    let lowered = full.to_lowercase();
    truncate_identifier(&lowered, max).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_names_unchanged() {
        assert_eq!(truncate_identifier("messages_pkey", 63), "messages_pkey");
        assert_eq!(truncate_identifier("", 63), "");
    }

    #[test]
    fn test_ascii_exactly_at_limit() {
        let name = "a".repeat(63);
        assert_eq!(truncate_identifier(&name, 63), name);
        let long = "a".repeat(64);
        assert_eq!(truncate_identifier(&long, 63), name);
    }

    #[test]
    fn test_multibyte_never_split() {
        // "é" is 2 bytes; a cut landing mid-character walks back one byte
        let name = format!("{}é", "a".repeat(62));
        let out = truncate_identifier(&name, 63);
        assert_eq!(out, "a".repeat(62));
        assert!(out.len() <= 63);
    }

    #[test]
    fn test_constraint_name_no_schema_is_lowercased_identity() {
        let name = build_constraint_name(ConstraintName {
            base: "Engram_Messages_Id_Unique",
            schema: None,
            max_bytes: None,
        });
        assert_eq!(name, "engram_messages_id_unique");
    }

    #[test]
    fn test_constraint_name_with_short_schema() {
        let name = build_constraint_name(ConstraintName {
            base: "messages_id_unique",
            schema: Some("memory"),
            max_bytes: None,
        });
        assert_eq!(name, "memory_messages_id_unique");
    }

    #[test]
    fn test_constraint_name_long_schema_truncates_like_backend() {
        let schema = "a_very_long_schema_namespace_used_by_one_of_our_deployments";
        let name = build_constraint_name(ConstraintName {
            base: "observational_memory_lookup_key_unique",
            schema: Some(schema),
            max_bytes: None,
        });
        let full = format!("{}_observational_memory_lookup_key_unique", schema);
        assert_eq!(name.len(), 63);
        assert!(full.starts_with(&name));
    }

    proptest! {
        #[test]
        fn prop_truncation_fits_budget(s in ".{0,200}") {
            let out = truncate_identifier(&s, MAX_IDENTIFIER_BYTES);
            prop_assert!(out.len() <= MAX_IDENTIFIER_BYTES);
        }

        #[test]
        fn prop_truncation_is_prefix_and_idempotent(s in ".{0,200}") {
            let once = truncate_identifier(&s, MAX_IDENTIFIER_BYTES);
            prop_assert!(s.starts_with(once));
            let twice = truncate_identifier(once, MAX_IDENTIFIER_BYTES);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_constraint_name_fits_budget(base in "[A-Za-z_]{1,100}", schema in "[A-Za-z_]{0,100}") {
            let schema = if schema.is_empty() { None } else { Some(schema.as_str()) };
            let name = build_constraint_name(ConstraintName { base: &base, schema, max_bytes: None });
            prop_assert!(name.len() <= MAX_IDENTIFIER_BYTES);
            prop_assert_eq!(name.clone(), name.to_lowercase());
        }
    }
}
