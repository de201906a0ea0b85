//! Input validation primitives.
//!
//! Each helper returns `Error::validation_invalid_argument` naming the field,
//! so callers can chain them with `?` at the CLI boundary.

use regex::Regex;

use crate::error::{Error, Result};

/// RFC 1123 hostname with at least two labels.
const HOSTNAME_PATTERN: &str =
    r"(?i)^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9][a-z0-9-]{0,61}[a-z0-9]$";

/// Loose character-class check used for local development domains.
const LOOSE_DOMAIN_PATTERN: &str = r"(?i)^[a-z0-9.-]+$";

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

fn is_match(pattern: &str, value: &str) -> Result<bool> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::internal_unexpected(format!("invalid pattern {}: {}", pattern, e)))?;
    Ok(re.is_match(value))
}

/// Require a string to be non-empty after trimming.
///
/// Returns a reference to the trimmed string on success.
pub fn require_non_empty<'a>(value: &'a str, field: &str, message: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::validation_invalid_argument(field, message, None, None))
    } else {
        Ok(trimmed)
    }
}

pub fn max_length(value: &str, field: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::validation_invalid_argument(
            field,
            format!("The {} may not be greater than {} characters", field, max),
            None,
            None,
        ));
    }
    Ok(())
}

pub fn min_length(value: &str, field: &str, min: usize) -> Result<()> {
    if value.chars().count() < min {
        return Err(Error::validation_invalid_argument(
            field,
            format!("The {} must be at least {} characters", field, min),
            None,
            None,
        ));
    }
    Ok(())
}

/// Letters, digits, dashes and underscores only, within `min..=max` characters.
pub fn alpha_dash(value: &str, field: &str, min: usize, max: usize) -> Result<()> {
    min_length(value, field, min)?;
    max_length(value, field, max)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation_invalid_argument(
            field,
            format!(
                "The {} may only contain letters, numbers, dashes and underscores",
                field
            ),
            Some(value.to_string()),
            None,
        ));
    }
    Ok(())
}

pub fn email(value: &str, field: &str, max: usize) -> Result<()> {
    max_length(value, field, max)?;
    if !is_match(EMAIL_PATTERN, value)? {
        return Err(Error::validation_invalid_argument(
            field,
            format!("The {} must be a valid email address", field),
            Some(value.to_string()),
            None,
        ));
    }
    Ok(())
}

/// Fully-qualified hostname check (labels of 1-63 chars, no leading or trailing dash).
pub fn is_hostname(value: &str) -> Result<bool> {
    if value.len() > 253 {
        return Ok(false);
    }
    is_match(HOSTNAME_PATTERN, value)
}

/// Character-class check only: letters, digits, dots and dashes.
pub fn is_loose_domain(value: &str) -> Result<bool> {
    is_match(LOOSE_DOMAIN_PATTERN, value)
}
