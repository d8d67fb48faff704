//! Run and correlation identifiers carried through a pipeline.

use serde::{Deserialize, Serialize};

use super::ids::EventId;
use super::job_type::JobType;

/// Identifiers shared by every stage of one pipeline run.
///
/// `run_id` is fixed for the whole run. `correlation_id` grows by one segment per
/// hop so a message's causal chain can be read back from its id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub run_id: String,
    pub correlation_id: String,
}

impl RunContext {
    /// Context for the first stage of a run.
    pub fn start(run_id: impl Into<String>, first: &JobType) -> Self {
        let run_id = run_id.into();
        let correlation_id = format!("{run_id}/{first}");
        Self {
            run_id,
            correlation_id,
        }
    }

    /// Context for a stage triggered by this one.
    pub fn child(&self, next: &JobType) -> Self {
        Self {
            run_id: self.run_id.clone(),
            correlation_id: format!("{}/{}", self.correlation_id, next),
        }
    }

    /// Number of hops since the run started.
    pub fn depth(&self) -> usize {
        self.correlation_id.matches('/').count()
    }
}

/// Singleton key for a stage message: `<type>:<natural key>`.
pub fn stage_key(job_type: &JobType, natural_key: &str) -> String {
    format!("{job_type}:{natural_key}")
}

/// Singleton key for an outbox publish: `outbox:<event id>`.
pub fn outbox_key(id: EventId) -> String {
    format!("outbox:{id}")
}

/// Singleton key for a scheduled fire: `schedule:<name>`.
pub fn schedule_key(name: &str) -> String {
    format!("schedule:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keeps_run_and_extends_correlation() {
        let discover = JobType::parse("lead.discover").unwrap();
        let enrich = JobType::parse("enrichment.run").unwrap();

        let root = RunContext::start("run-1", &discover);
        let child = root.child(&enrich);

        assert_eq!(child.run_id, "run-1");
        assert_eq!(child.correlation_id, "run-1/lead.discover/enrichment.run");
        assert!(child.correlation_id.starts_with(&root.correlation_id));
        assert_eq!(root.depth(), 1);
        assert_eq!(child.depth(), 2);
    }

    #[test]
    fn serializes_with_payload_field_names() {
        let ctx = RunContext::start("run-9", &JobType::parse("score.compute").unwrap());
        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(v["runId"], "run-9");
        assert_eq!(v["correlationId"], "run-9/score.compute");
    }

    #[test]
    fn keys_are_deterministic() {
        let ty = JobType::parse("message.send").unwrap();
        assert_eq!(stage_key(&ty, "lead-42"), "message.send:lead-42");
        assert_eq!(stage_key(&ty, "lead-42"), stage_key(&ty, "lead-42"));
        assert_eq!(schedule_key("nightly-discovery"), "schedule:nightly-discovery");
    }
}
