//! Validated names used as store identifiers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DataqsError, Result};

/// Postgres truncates identifiers past 63 bytes; leave room for slot suffixes.
pub const MAX_DATASET_NAME_LEN: usize = 48;

/// Name of a dataset, field or slot.
///
/// Names double as SQL identifiers and file names, so they are restricted to
/// lowercase ASCII letters, digits and underscores, starting with a letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetName(String);

impl DatasetName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a sibling name such as `quakes_tmp` from `quakes`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}_{}", self.0, suffix))
    }
}

impl std::fmt::Display for DatasetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DatasetName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DatasetName {
    type Error = DataqsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DatasetName> for String {
    fn from(value: DatasetName) -> Self {
        value.0
    }
}

impl std::str::FromStr for DatasetName {
    type Err = DataqsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Check that `name` is usable as an unquoted store identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DataqsError::invalid_identifier(name, "must not be empty"));
    }
    if name.len() > MAX_DATASET_NAME_LEN {
        return Err(DataqsError::invalid_identifier(
            name,
            format!("longer than {} characters", MAX_DATASET_NAME_LEN),
        ));
    }

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    if !first_ok {
        return Err(DataqsError::invalid_identifier(name, "must start with a lowercase letter"));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(DataqsError::invalid_identifier(
            name,
            "only lowercase letters, digits and underscores are allowed",
        ));
    }

    Ok(())
}

/// Identifier of one job run, used for span fields and staging prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell runs apart in file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
