//! Schema naming for the main and shard stores.
//!
//! Shard DDL and batch SQL interpolate schema names with `format!`, so every
//! name goes through [`validate_schema_name`] first.

use strata_core::defaults::{MAIN_SCHEMA, SHARD_SCHEMA_PREFIX};
use strata_core::{Error, Result, ShardId};

/// PostgreSQL identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 63;

const RESERVED_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// Validate a PostgreSQL schema name for use in generated SQL.
///
/// Names must be non-empty, at most 63 bytes, start with a letter or
/// underscore and contain only ASCII alphanumerics and underscores.
///
/// ```
/// use strata_db::validate_schema_name;
///
/// assert!(validate_schema_name("shard_1000").is_ok());
/// assert!(validate_schema_name("shard_-5").is_err());
/// assert!(validate_schema_name("").is_err());
/// ```
pub fn validate_schema_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(
            "Schema name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidInput(format!(
            "Schema name exceeds {} character limit: {} characters",
            MAX_IDENTIFIER_LEN,
            name.len()
        )));
    }

    if let Some(first) = name.chars().next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(Error::InvalidInput(format!(
                "Schema name must start with a letter or underscore, found: '{}'",
                first
            )));
        }
    }

    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_')
    {
        return Err(Error::InvalidInput(format!(
            "Schema name contains invalid character: '{}'",
            ch
        )));
    }

    if RESERVED_SCHEMAS.contains(&name.to_lowercase().as_str()) {
        return Err(Error::InvalidInput(format!(
            "Schema name '{}' is reserved",
            name
        )));
    }

    Ok(())
}

/// Schema holding the shard store for `shard`, e.g. `shard_1000`.
pub fn shard_schema_name(shard: ShardId) -> Result<String> {
    let name = format!("{}{}", SHARD_SCHEMA_PREFIX, shard.value());
    validate_schema_name(&name)?;
    Ok(name)
}

/// Schema holding the main store.
pub fn main_schema_name() -> &'static str {
    MAIN_SCHEMA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_schema_name_valid() {
        assert!(validate_schema_name("public").is_ok());
        assert!(validate_schema_name("shard_1").is_ok());
        assert!(validate_schema_name("_private").is_ok());
        assert!(validate_schema_name("Shard_Test_123").is_ok());
    }

    #[test]
    fn test_validate_schema_name_rejects_injection() {
        for name in ["shard; DROP TABLE block", "shard-1", "shard.1", "shard 1", "\"x\""] {
            assert!(
                matches!(validate_schema_name(name), Err(Error::InvalidInput(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_validate_schema_name_limits() {
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("1shard").is_err());
        assert!(validate_schema_name(&"a".repeat(63)).is_ok());
        assert!(validate_schema_name(&"a".repeat(64)).is_err());
        assert!(validate_schema_name("PG_CATALOG").is_err());
    }

    #[test]
    fn test_shard_schema_name() {
        assert_eq!(shard_schema_name(ShardId(1000)).unwrap(), "shard_1000");
        assert!(shard_schema_name(ShardId(-1)).is_err());
        assert_eq!(main_schema_name(), "public");
    }
}
