//! Validated template name newtype.
//!
//! Template names become VM names on the platform, metadata keys, and work
//! directory prefixes, so they are restricted to a conservative charset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Longest accepted template name.
pub const MAX_TEMPLATE_NAME_LEN: usize = 64;

/// Check a candidate template name: 1 to 64 characters drawn from ASCII
/// alphanumerics, `-`, `_` and `.`.
pub fn validate_template_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("template name must not be empty".to_owned());
    }
    if name.len() > MAX_TEMPLATE_NAME_LEN {
        return Err(format!(
            "template name '{name}' exceeds {MAX_TEMPLATE_NAME_LEN} characters"
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!(
            "template name '{name}' contains invalid character '{bad}'"
        ));
    }
    Ok(())
}

/// A template name that passed [`validate_template_name`].
///
/// Serializes as a plain string; deserialization rejects invalid names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemplateName(String);

impl TemplateName {
    pub fn new(s: impl Into<String>) -> Result<Self, String> {
        let s = s.into();
        validate_template_name(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Derive a valid name from arbitrary text, replacing disallowed
    /// characters with `-` and truncating. Returns `None` when nothing usable
    /// remains.
    pub fn sanitize(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_TEMPLATE_NAME_LEN)
            .collect();
        let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
        Self::new(trimmed).ok()
    }
}

impl TryFrom<String> for TemplateName {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for TemplateName {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TemplateName> for String {
    fn from(name: TemplateName) -> Self {
        name.0
    }
}

impl Deref for TemplateName {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TemplateName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for TemplateName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for TemplateName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TemplateName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
