//! Language codes
//!
//! Languages travel as ISO-639-1-style short codes ("en", "vi", "hi").
//! Which codes a deployment accepts is a configured whitelist; this type
//! only enforces the syntactic shape.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// A normalized short language code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LangCode(String);

impl LangCode {
    /// Parse and normalize a code: 2-3 ASCII letters, lowercased
    pub fn parse(code: &str) -> Result<Self> {
        let trimmed = code.trim();
        if !(2..=3).contains(&trimmed.len()) || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoreError::UnknownLanguage(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// The auto-detect sentinel: no source language, the model decides.
    ///
    /// Travels as an empty string on the wire. `parse` never produces it;
    /// sessions get it only from an unset configured default.
    pub fn auto() -> Self {
        Self(String::new())
    }

    pub fn is_auto(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LangCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LangCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
