//! Outbox event: a pending publish recorded in the same transaction as a domain write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::TransitionError;
use super::ids::EventId;
use super::job_type::JobType;
use super::run::RunContext;
use crate::typed::codec::{self, CodecError};
use crate::typed::Job;

/// Outbox event status.
///
/// State transitions:
/// - Pending -> Processing -> Sent
/// - Pending -> Processing -> Failed -> Processing -> ... (until max_attempts)
/// - Pending -> Processing -> DeadLetter
/// - Processing -> Processing (stale lock reclaimed by another dispatcher)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Sent,
        OutboxStatus::Failed,
        OutboxStatus::DeadLetter,
    ];

    /// Terminal events are never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown outbox status '{s}'"))
    }
}

/// How a claimed event leaves `processing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Published (or found already handled). `attempted` is false when no publish was made.
    Sent { attempted: bool },

    /// Publish failed; eligible again at `next_attempt_at`.
    Failed {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },

    /// Given up on. `attempted` is true when this resolution follows a publish attempt.
    DeadLetter { reason: String, attempted: bool },
}

impl Resolution {
    pub fn target_status(&self) -> OutboxStatus {
        match self {
            Resolution::Sent { .. } => OutboxStatus::Sent,
            Resolution::Failed { .. } => OutboxStatus::Failed,
            Resolution::DeadLetter { .. } => OutboxStatus::DeadLetter,
        }
    }

    fn counts_attempt(&self) -> bool {
        match self {
            Resolution::Sent { attempted } | Resolution::DeadLetter { attempted, .. } => *attempted,
            Resolution::Failed { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        id: EventId,
        job_type: JobType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_type,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Outbox row announcing `job`, with `ctx` attached to the payload.
    pub fn for_job<J: Job>(
        id: EventId,
        job: &J,
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(id, J::job_type(), codec::encode(job, ctx)?, now))
    }

    /// Whether a dispatcher may claim this event at `now`.
    ///
    /// `stale_before` is the cutoff for `processing` rows whose owner is presumed dead.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self.next_attempt_at.is_none_or(|at| at <= now),
            OutboxStatus::Processing => self.updated_at < stale_before,
            OutboxStatus::Sent | OutboxStatus::DeadLetter => false,
        }
    }

    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        self.status = OutboxStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// Move a claimed event out of `processing`.
    pub fn apply(&mut self, resolution: Resolution, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            OutboxStatus::Processing => {}
            status if status.is_terminal() => {
                return Err(TransitionError::Terminal { id: self.id, status });
            }
            status => return Err(TransitionError::NotClaimed { id: self.id, status }),
        }

        if resolution.counts_attempt() {
            self.attempts = self.attempts.saturating_add(1);
        }
        self.status = resolution.target_status();
        self.updated_at = now;

        match resolution {
            Resolution::Sent { .. } => {
                self.last_error = None;
                self.next_attempt_at = None;
                self.processed_at = Some(now);
            }
            Resolution::Failed {
                error,
                next_attempt_at,
            } => {
                self.last_error = Some(error);
                self.next_attempt_at = Some(next_attempt_at);
            }
            Resolution::DeadLetter { reason, .. } => {
                self.last_error = Some(reason);
                self.next_attempt_at = None;
                self.processed_at = Some(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn event() -> OutboxEvent {
        OutboxEvent::new(
            EventId::from_ulid(Ulid::new()),
            JobType::parse("enrichment.run").unwrap(),
            serde_json::json!({"leadId": "lead-1"}),
            t0(),
        )
    }

    #[test]
    fn typed_event_carries_run_context() {
        #[derive(Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DiscoverLeads {
            region: String,
        }

        impl Job for DiscoverLeads {
            const TYPE: &'static str = "lead.discover";

            fn natural_key(&self) -> String {
                self.region.clone()
            }
        }

        let job = DiscoverLeads {
            region: "emea".to_string(),
        };
        let ctx = RunContext::start("run-1", &DiscoverLeads::job_type());
        let e = OutboxEvent::for_job(EventId::from_ulid(Ulid::new()), &job, &ctx, t0()).unwrap();

        assert_eq!(e.job_type.as_str(), "lead.discover");
        assert_eq!(e.status, OutboxStatus::Pending);
        assert_eq!(
            e.payload,
            serde_json::json!({
                "region": "emea",
                "runId": "run-1",
                "correlationId": "run-1/lead.discover",
            })
        );
    }

    #[test]
    fn new_event_is_pending_and_claimable() {
        let e = event();
        assert_eq!(e.status, OutboxStatus::Pending);
        assert_eq!(e.attempts, 0);
        assert!(e.is_claimable(t0(), t0() - ChronoDuration::minutes(5)));
    }

    #[test]
    fn sent_resolution_clears_retry_metadata() {
        let mut e = event();
        e.claim(t0()).unwrap();
        e.apply(
            Resolution::Failed {
                error: "boom".into(),
                next_attempt_at: t0() + ChronoDuration::seconds(5),
            },
            t0(),
        )
        .unwrap();
        assert_eq!(e.attempts, 1);

        let later = t0() + ChronoDuration::seconds(10);
        e.claim(later).unwrap();
        e.apply(Resolution::Sent { attempted: true }, later).unwrap();

        assert_eq!(e.status, OutboxStatus::Sent);
        assert_eq!(e.attempts, 2);
        assert_eq!(e.last_error, None);
        assert_eq!(e.next_attempt_at, None);
        assert_eq!(e.processed_at, Some(later));
    }

    #[test]
    fn skipped_publish_does_not_count_an_attempt() {
        let mut e = event();
        e.claim(t0()).unwrap();
        e.apply(Resolution::Sent { attempted: false }, t0()).unwrap();
        assert_eq!(e.attempts, 0);
        assert_eq!(e.status, OutboxStatus::Sent);
    }

    #[rstest]
    #[case(Resolution::Sent { attempted: true })]
    #[case(Resolution::DeadLetter { reason: "max attempts exceeded".into(), attempted: false })]
    fn terminal_events_reject_further_transitions(#[case] resolution: Resolution) {
        let mut e = event();
        e.claim(t0()).unwrap();
        e.apply(resolution, t0()).unwrap();
        let snapshot = e.clone();

        assert!(matches!(e.claim(t0()), Err(TransitionError::Terminal { .. })));
        assert!(matches!(
            e.apply(Resolution::Sent { attempted: true }, t0()),
            Err(TransitionError::Terminal { .. })
        ));
        assert_eq!(e, snapshot);
        assert!(!e.is_claimable(t0() + ChronoDuration::days(1), t0() + ChronoDuration::days(1)));
    }

    #[test]
    fn unclaimed_event_cannot_be_resolved() {
        let mut e = event();
        let err = e.apply(Resolution::Sent { attempted: true }, t0()).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::NotClaimed {
                status: OutboxStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn failed_event_waits_for_next_attempt_at() {
        let mut e = event();
        e.claim(t0()).unwrap();
        let retry_at = t0() + ChronoDuration::seconds(5);
        e.apply(
            Resolution::Failed {
                error: "timeout".into(),
                next_attempt_at: retry_at,
            },
            t0(),
        )
        .unwrap();

        let stale = t0() - ChronoDuration::minutes(5);
        assert!(!e.is_claimable(t0() + ChronoDuration::seconds(4), stale));
        assert!(e.is_claimable(retry_at, stale));
    }

    #[test]
    fn processing_event_is_reclaimable_only_when_stale() {
        let mut e = event();
        e.claim(t0()).unwrap();

        let soon = t0() + ChronoDuration::minutes(1);
        assert!(!e.is_claimable(soon, soon - ChronoDuration::minutes(5)));

        let later = t0() + ChronoDuration::minutes(6);
        assert!(e.is_claimable(later, later - ChronoDuration::minutes(5)));
    }

    #[test]
    fn status_parses_from_column_text() {
        for status in OutboxStatus::ALL {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&OutboxStatus::DeadLetter).unwrap(),
            "\"dead_letter\""
        );
        assert!("done".parse::<OutboxStatus>().is_err());
    }
}
