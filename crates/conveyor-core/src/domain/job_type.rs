//! JobType - queue / job naming.
//!
//! A job type names both the queue a message lands in and the handler that
//! consumes it. Naming rule: lowercase dot-separated segments of `[a-z0-9_-]`,
//! e.g. `enrichment.run`, `lead.discover`, `enrichment.run.dlq`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidJobType {
    #[error("job type must not be empty")]
    Empty,

    #[error("job type '{0}' has an empty segment")]
    EmptySegment(String),

    #[error("job type '{value}' contains invalid character {ch:?}")]
    InvalidChar { value: String, ch: char },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobType(String);

impl JobType {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidJobType> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvalidJobType::Empty);
        }
        if value.split('.').any(str::is_empty) {
            return Err(InvalidJobType::EmptySegment(value));
        }
        if let Some(ch) = value
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')))
        {
            return Err(InvalidJobType::InvalidChar { value, ch });
        }
        Ok(Self(value))
    }

    /// Wraps a compile-time name without validating it. Registries re-check with `parse`.
    pub(crate) fn from_static(value: &'static str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conventional dead-letter queue name for this type (`<type>.dlq`).
    pub fn dead_letter(&self) -> JobType {
        JobType(format!("{}.dlq", self.0))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobType {
    type Err = InvalidJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobType {
    type Error = InvalidJobType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.0
    }
}

impl AsRef<str> for JobType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
