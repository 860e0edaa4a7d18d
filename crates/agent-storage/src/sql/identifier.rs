//! Identifier gate for dynamically named tables, columns and indexes
//!
//! Every caller-supplied name that ends up inside SQL text goes through
//! [`parse_sql_identifier`] first. Values are always bound as parameters and
//! never reach this module.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Result, StorageError};

/// Postgres truncates longer names; the other dialects accept it as well.
pub const MAX_IDENTIFIER_LEN: usize = 63;

lazy_static! {
    static ref IDENTIFIER_RE: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid");
}

/// Returns `name` unchanged when it is a safe SQL identifier.
pub fn parse_sql_identifier<'a>(name: &'a str, kind: &str) -> Result<&'a str> {
    if name.len() > MAX_IDENTIFIER_LEN || !IDENTIFIER_RE.is_match(name) {
        return Err(StorageError::user(
            "STORAGE_INVALID_IDENTIFIER",
            format!(
                "Invalid {kind} name {name:?}: must start with a letter or underscore, \
                 contain only letters, digits or underscores, and be at most \
                 {MAX_IDENTIFIER_LEN} characters"
            ),
        )
        .with_detail("identifier", name)
        .with_detail("kind", kind));
    }
    Ok(name)
}

/// Validates a dotted JSON key path such as `http.status` used in attribute
/// filters. Each segment must be a safe identifier.
pub fn parse_field_key(key: &str) -> Result<&str> {
    if key.is_empty() {
        return Err(StorageError::user(
            "STORAGE_INVALID_IDENTIFIER",
            "JSON field key must not be empty",
        ));
    }
    for segment in key.split('.') {
        parse_sql_identifier(segment, "JSON field key")?;
    }
    Ok(key)
}

/// A validated identifier. Quoting is the dialect's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        parse_sql_identifier(name.as_ref(), "identifier").map(|n| Ident(n.to_string()))
    }

    pub fn table(name: impl AsRef<str>) -> Result<Self> {
        parse_sql_identifier(name.as_ref(), "table").map(|n| Ident(n.to_string()))
    }

    pub fn column(name: impl AsRef<str>) -> Result<Self> {
        parse_sql_identifier(name.as_ref(), "column").map(|n| Ident(n.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
