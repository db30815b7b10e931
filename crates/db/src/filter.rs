//! Filter-expression helpers for store queries.
//!
//! Filepaths flow into SQL-like filter strings, so values are sanitized
//! before interpolation: control characters are rejected outright, quotes
//! and backslashes are escaped.

use crate::connection::{DbError, Result};

/// Escape a string literal for use inside a single-quoted filter value.
pub fn escape_literal(value: &str) -> String {
  value.replace('\\', "\\\\").replace('\'', "''")
}

/// Validate and escape a filepath for filter interpolation.
pub fn sanitize_filepath(filepath: &str) -> Result<String> {
  if filepath.chars().any(|c| c.is_control()) {
    return Err(DbError::InvalidInput(format!(
      "filepath contains control characters: {:?}",
      filepath
    )));
  }
  Ok(escape_literal(filepath))
}

/// Build the canonical `filepath = '<sanitized>'` filter.
pub fn filepath_filter(filepath: &str) -> Result<String> {
  Ok(format!("filepath = '{}'", sanitize_filepath(filepath)?))
}
