//! Declarative retry policy table, loaded from configuration and checked at startup.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::domain::{InvalidJobType, JobType};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy for '{job_type}' is missing required field '{field}'")]
    MissingField {
        job_type: String,
        field: &'static str,
    },

    #[error("invalid job type in policy table: {0}")]
    InvalidName(#[from] InvalidJobType),

    #[error("job type '{0}' has no retry policy")]
    MissingPolicy(JobType),

    #[error("policy given for unregistered job type '{0}'")]
    UnknownType(JobType),

    #[error("dead-letter queue '{0}' must not carry a retry policy")]
    DeadLetterHasPolicy(JobType),

    #[error("job type '{0}' dead-letters into itself")]
    SelfDeadLetter(JobType),
}

/// Policy entry as written in configuration. Every field is required; the
/// `Option`s only exist so a missing field is reported by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    pub retry_limit: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub retry_backoff: Option<bool>,
    pub dead_letter: Option<String>,
}

impl PolicyConfig {
    fn resolve(&self, job_type: &str) -> Result<RetryPolicy, PolicyError> {
        let missing = |field| PolicyError::MissingField {
            job_type: job_type.to_string(),
            field,
        };
        let dead_letter = self.dead_letter.as_deref().ok_or_else(|| missing("dead_letter"))?;
        Ok(RetryPolicy {
            retry_limit: self.retry_limit.ok_or_else(|| missing("retry_limit"))?,
            retry_delay: Duration::from_secs(
                self.retry_delay_secs.ok_or_else(|| missing("retry_delay_secs"))?,
            ),
            retry_backoff: self.retry_backoff.ok_or_else(|| missing("retry_backoff"))?,
            dead_letter: JobType::parse(dead_letter)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicyTable {
    policies: BTreeMap<JobType, RetryPolicy>,
}

impl RetryPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &BTreeMap<String, PolicyConfig>) -> Result<Self, PolicyError> {
        let mut table = Self::new();
        for (name, entry) in entries {
            let job_type = JobType::parse(name.as_str())?;
            table.insert(job_type, entry.resolve(name)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, job_type: JobType, policy: RetryPolicy) -> &mut Self {
        self.policies.insert(job_type, policy);
        self
    }

    pub fn get(&self, job_type: &JobType) -> Option<&RetryPolicy> {
        self.policies.get(job_type)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Every queue some policy dead-letters into.
    pub fn dead_letter_queues(&self) -> BTreeSet<JobType> {
        self.policies.values().map(|p| p.dead_letter.clone()).collect()
    }

    /// Check the table against the registered job types. Run once at startup.
    pub fn validate(&self, registered: &[JobType]) -> Result<(), PolicyError> {
        let registered: BTreeSet<&JobType> = registered.iter().collect();
        let sinks = self.dead_letter_queues();

        for job_type in &registered {
            if !self.policies.contains_key(*job_type) {
                return Err(PolicyError::MissingPolicy((*job_type).clone()));
            }
        }
        for (job_type, policy) in &self.policies {
            if policy.dead_letter == *job_type {
                return Err(PolicyError::SelfDeadLetter(job_type.clone()));
            }
            if sinks.contains(job_type) {
                return Err(PolicyError::DeadLetterHasPolicy(job_type.clone()));
            }
            if !registered.contains(job_type) {
                return Err(PolicyError::UnknownType(job_type.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dead_letter: &str) -> PolicyConfig {
        PolicyConfig {
            retry_limit: Some(3),
            retry_delay_secs: Some(30),
            retry_backoff: Some(true),
            dead_letter: Some(dead_letter.to_string()),
        }
    }

    fn ty(name: &str) -> JobType {
        JobType::parse(name).unwrap()
    }

    #[test]
    fn loads_complete_entries() {
        let mut entries = BTreeMap::new();
        entries.insert("enrichment.run".to_string(), entry("enrichment.run.dlq"));

        let table = RetryPolicyTable::from_config(&entries).unwrap();
        let policy = table.get(&ty("enrichment.run")).unwrap();
        assert_eq!(policy.retry_limit, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(30));
        assert_eq!(policy.dead_letter, ty("enrichment.run.dlq"));
        table.validate(&[ty("enrichment.run")]).unwrap();
    }

    #[test]
    fn missing_field_is_named() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "score.compute".to_string(),
            PolicyConfig {
                retry_backoff: None,
                ..entry("score.compute.dlq")
            },
        );
        let err = RetryPolicyTable::from_config(&entries).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::MissingField {
                field: "retry_backoff",
                ..
            }
        ));
    }

    #[test]
    fn every_registered_type_needs_a_policy() {
        let table = RetryPolicyTable::new();
        let err = table.validate(&[ty("lead.discover")]).unwrap_err();
        assert!(matches!(err, PolicyError::MissingPolicy(_)));
    }

    #[test]
    fn dead_letter_queue_cannot_have_a_policy() {
        let mut entries = BTreeMap::new();
        entries.insert("message.send".to_string(), entry("message.send.dlq"));
        entries.insert("message.send.dlq".to_string(), entry("message.send.graveyard"));
        let table = RetryPolicyTable::from_config(&entries).unwrap();

        let err = table
            .validate(&[ty("message.send"), ty("message.send.dlq")])
            .unwrap_err();
        assert!(matches!(err, PolicyError::DeadLetterHasPolicy(t) if t.as_str() == "message.send.dlq"));
    }

    #[test]
    fn policy_for_unregistered_type_fails() {
        let mut entries = BTreeMap::new();
        entries.insert("feedback.collect".to_string(), entry("feedback.collect.dlq"));
        let table = RetryPolicyTable::from_config(&entries).unwrap();
        assert!(matches!(
            table.validate(&[]),
            Err(PolicyError::UnknownType(_))
        ));
    }

    #[test]
    fn self_dead_letter_fails() {
        let mut table = RetryPolicyTable::new();
        table.insert(
            ty("model.retrain"),
            entry("model.retrain").resolve("model.retrain").unwrap(),
        );
        assert!(matches!(
            table.validate(&[ty("model.retrain")]),
            Err(PolicyError::SelfDeadLetter(_))
        ));
    }
}
