//! Heartbeat message parsing.
//!
//! Grammar: `identifier,displayName,key=value,key=value,...`
//!
//! - The first two comma-separated tokens are positional and must be non-empty.
//! - At least three top-level tokens are required; the third may be empty.
//! - Remaining tokens without `=` are skipped.
//! - `value` is everything after the first `=`, kept verbatim.
//! - Keys outside the known field set are collected in
//!   [`Heartbeat::ignored_keys`] and never stored. Whether they should instead
//!   reject the message is a product decision; today they are tolerated.
//! - A repeated key keeps its last value.
//!
//! The parser takes `&str`; callers reject invalid UTF-8 before calling it.

use crate::field::{SensorField, SensorFields};
use std::convert::TryFrom;

/// Minimum number of top-level tokens in a valid message.
pub const MIN_TOKENS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected at least {MIN_TOKENS} comma-separated fields, found {found}")]
    TooFewFields { found: usize },
    #[error("identifier is empty")]
    EmptyIdentifier,
    #[error("display name is empty")]
    EmptyName,
}

/// One parsed heartbeat, before any identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub mac: String,
    pub name: String,
    pub fields: SensorFields,
    /// `key=value` keys that are not known sensor fields, in arrival order.
    pub ignored_keys: Vec<String>,
}

impl TryFrom<&str> for Heartbeat {
    type Error = ParseError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let parts: Vec<&str> = line.trim().split(',').collect();
        if parts.len() < MIN_TOKENS {
            return Err(ParseError::TooFewFields { found: parts.len() });
        }

        let mac = parts[0];
        if mac.is_empty() {
            return Err(ParseError::EmptyIdentifier);
        }
        let name = parts[1];
        if name.is_empty() {
            return Err(ParseError::EmptyName);
        }

        let mut fields = SensorFields::new();
        let mut ignored_keys = Vec::new();
        for item in &parts[2..] {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            match SensorField::from_key(key) {
                Some(field) => fields.set(field, value),
                None => ignored_keys.push(key.to_owned()),
            }
        }

        Ok(Heartbeat {
            mac: mac.to_owned(),
            name: name.to_owned(),
            fields,
            ignored_keys,
        })
    }
}

/// Parse one complete message line.
pub fn parse_message(line: &str) -> Result<Heartbeat, ParseError> {
    Heartbeat::try_from(line)
}
