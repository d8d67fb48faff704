//! Scheduler - cron による run の定期起動
//!
//! 各 fire は `Chainer` 経由で新しい run を開始し、singleton key は
//! `schedule:<name>`。前回 fire の先頭ステージがまだキューに live なら、
//! 次の fire は重ならずに吸収される。
//!
//! 式は `cron` クレートの文法（`sec min hour dom month dow [year]`）。
//! 5 フィールドの crontab 式には秒フィールド `0` を前置する。曜日の数値は
//! `cron` クレートに従う（1 = 日曜）ので、名前（`MON-FRI`）が安全。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::chain::Chainer;
use crate::domain::JobType;
use crate::domain::run::schedule_key;
use crate::ports::Clock;
use crate::typed::JobRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("schedule '{0}' is already registered")]
    DuplicateName(String),

    #[error("schedule targets unknown job type '{0}'")]
    UnknownQueue(JobType),

    #[error("schedule targets '{0}', which has no retry policy")]
    MissingPolicy(JobType),

    #[error("payload template for '{queue}' is invalid: {reason}")]
    InvalidPayload { queue: JobType, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Defaults to the queue name, so one schedule per queue unless named.
    pub name: Option<String>,
}

impl ScheduleOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

struct Entry {
    name: String,
    queue: JobType,
    schedule: Schedule,
    payload: Value,
    next_fire: Option<DateTime<Utc>>,
}

/// What one tick did with a due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fire {
    Started { name: String, run_id: String },
    /// The previous fire's run has not left the first queue yet.
    Overlapping { name: String },
    Failed { name: String, error: String },
}

pub struct Scheduler {
    chainer: Arc<Chainer>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    entries: Vec<Entry>,
}

/// Accept crontab's five fields by prefixing a zero seconds field.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

impl Scheduler {
    pub fn new(
        chainer: Arc<Chainer>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chainer,
            registry,
            clock,
            poll_interval,
            entries: Vec::new(),
        }
    }

    /// Register a recurring run of `queue` seeded with `payload_template`.
    pub fn schedule(
        &mut self,
        queue: &JobType,
        cron: &str,
        payload_template: Value,
        options: ScheduleOptions,
    ) -> Result<(), ScheduleError> {
        let name = options.name.unwrap_or_else(|| queue.to_string());
        if self.entries.iter().any(|e| e.name == name) {
            return Err(ScheduleError::DuplicateName(name));
        }

        let expr = normalize_cron(cron);
        let schedule = Schedule::from_str(&expr).map_err(|e| ScheduleError::InvalidCron {
            expr: cron.to_string(),
            reason: e.to_string(),
        })?;

        let schema = self
            .registry
            .schema(queue)
            .ok_or_else(|| ScheduleError::UnknownQueue(queue.clone()))?;
        if !self.chainer.has_policy(queue) {
            return Err(ScheduleError::MissingPolicy(queue.clone()));
        }
        schema
            .validate(&payload_template)
            .map_err(|e| ScheduleError::InvalidPayload {
                queue: queue.clone(),
                reason: e.to_string(),
            })?;

        let next_fire = schedule.after(&self.clock.now()).next();
        info!(schedule = %name, queue = %queue, cron = %expr, next_fire = ?next_fire, "schedule registered");
        self.entries.push(Entry {
            name,
            queue: queue.clone(),
            schedule,
            payload: payload_template,
            next_fire,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next fire time of schedule `name`.
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.next_fire)
    }

    /// Fire every due entry once. Missed fires collapse into one.
    pub async fn tick(&mut self) -> Vec<Fire> {
        let now = self.clock.now();
        let mut fired = Vec::new();

        for entry in &mut self.entries {
            if entry.next_fire.is_none_or(|at| at > now) {
                continue;
            }
            entry.next_fire = entry.schedule.after(&now).next();

            let started = self
                .chainer
                .start_run_raw(&entry.queue, entry.payload.clone(), schedule_key(&entry.name))
                .await;
            let name = entry.name.clone();
            match started {
                Ok(enqueued) if enqueued.published.is_duplicate() => {
                    warn!(schedule = %name, "previous scheduled run still queued; skipping fire");
                    fired.push(Fire::Overlapping { name });
                }
                Ok(enqueued) => {
                    info!(
                        schedule = %name,
                        queue = %entry.queue,
                        run_id = %enqueued.run.run_id,
                        next_fire = ?entry.next_fire,
                        "scheduled run started"
                    );
                    fired.push(Fire::Started {
                        name,
                        run_id: enqueued.run.run_id,
                    });
                }
                Err(e) => {
                    error!(schedule = %name, error = %e, "scheduled run failed to start");
                    fired.push(Fire::Failed {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
        fired
    }

    /// Tick every `poll_interval` until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(schedules = self.entries.len(), "scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rstest::rstest;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::impls::InMemoryJobQueue;
    use crate::policy::{RetryPolicy, RetryPolicyTable};
    use crate::ports::{FixedClock, JobQueue, UlidGenerator};
    use crate::typed::Job;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct DiscoverLeads {
        region: String,
        limit: u32,
    }

    impl Job for DiscoverLeads {
        const TYPE: &'static str = "lead.discover";

        fn natural_key(&self) -> String {
            self.region.clone()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 6, 8, 59, 30).unwrap()
    }

    fn setup() -> (Scheduler, InMemoryJobQueue, FixedClock) {
        let clock = FixedClock::new(t0());
        let queue = InMemoryJobQueue::new(Arc::new(clock.clone()));

        let mut registry = JobRegistry::new();
        registry.declare::<DiscoverLeads>().unwrap();
        let mut policies = RetryPolicyTable::new();
        policies.insert(
            DiscoverLeads::job_type(),
            RetryPolicy {
                retry_limit: 2,
                retry_delay: Duration::from_secs(60),
                retry_backoff: true,
                dead_letter: DiscoverLeads::job_type().dead_letter(),
            },
        );
        let chainer = Arc::new(Chainer::new(
            Arc::new(queue.clone()),
            Arc::new(policies),
            Arc::new(UlidGenerator::new(clock.clone())),
            Duration::from_secs(5),
        ));
        let scheduler = Scheduler::new(
            chainer,
            Arc::new(registry),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        (scheduler, queue, clock)
    }

    fn template() -> Value {
        json!({ "region": "emea", "limit": 50 })
    }

    #[rstest]
    #[case("0 9 * * *", "0 0 9 * * *")]
    #[case("  */5 * * * *  ", "0 */5 * * * *")]
    #[case("30 0 9 * * *", "30 0 9 * * *")]
    #[case("0 0 9 * * MON-FRI 2026", "0 0 9 * * MON-FRI 2026")]
    fn crontab_expressions_gain_seconds_field(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_cron(input), expected);
    }

    #[tokio::test]
    async fn due_entry_starts_a_run_once_per_fire() {
        let (mut scheduler, queue, clock) = setup();
        scheduler
            .schedule(&DiscoverLeads::job_type(), "0 9 * * *", template(), ScheduleOptions::named("daily"))
            .unwrap();
        let first_fire = Utc.with_ymd_and_hms(2026, 7, 6, 9, 0, 0).unwrap();
        assert_eq!(scheduler.next_fire("daily"), Some(first_fire));

        assert!(scheduler.tick().await.is_empty());

        clock.set(first_fire);
        let fired = scheduler.tick().await;
        assert!(matches!(fired.as_slice(), [Fire::Started { name, .. }] if name == "daily"));
        assert_eq!(scheduler.next_fire("daily"), Some(first_fire + ChronoDuration::days(1)));

        let leases = queue.fetch(&DiscoverLeads::job_type(), 10).await.unwrap();
        assert_eq!(leases.len(), 1);
        let message = leases[0].message();
        assert_eq!(message.singleton_key(), Some("schedule:daily"));
        assert_eq!(message.payload["region"], json!("emea"));
        assert!(message.payload["runId"].as_str().unwrap().starts_with("run-"));

        // Same instant again: nothing new is due.
        assert!(scheduler.tick().await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_fire_is_absorbed_by_singleton_key() {
        let (mut scheduler, queue, clock) = setup();
        scheduler
            .schedule(&DiscoverLeads::job_type(), "* * * * *", template(), ScheduleOptions::default())
            .unwrap();

        clock.advance(ChronoDuration::seconds(30));
        assert!(matches!(scheduler.tick().await[0], Fire::Started { .. }));

        clock.advance(ChronoDuration::minutes(1));
        let fired = scheduler.tick().await;
        assert_eq!(
            fired,
            vec![Fire::Overlapping {
                name: "lead.discover".to_string()
            }]
        );
        assert_eq!(queue.counts(&DiscoverLeads::job_type()).await.queued, 1);
    }

    #[tokio::test]
    async fn rejects_bad_registrations() {
        let (mut scheduler, _queue, _clock) = setup();
        let queue = DiscoverLeads::job_type();

        assert!(matches!(
            scheduler.schedule(&queue, "not a cron", template(), ScheduleOptions::default()),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            scheduler.schedule(&JobType::parse("model.retrain").unwrap(), "0 3 * * *", json!({}), ScheduleOptions::default()),
            Err(ScheduleError::UnknownQueue(_))
        ));
        assert!(matches!(
            scheduler.schedule(&queue, "0 3 * * *", json!({ "region": "emea" }), ScheduleOptions::default()),
            Err(ScheduleError::InvalidPayload { .. })
        ));

        scheduler
            .schedule(&queue, "0 3 * * *", template(), ScheduleOptions::named("nightly"))
            .unwrap();
        assert!(matches!(
            scheduler.schedule(&queue, "0 4 * * *", template(), ScheduleOptions::named("nightly")),
            Err(ScheduleError::DuplicateName(name)) if name == "nightly"
        ));
        assert_eq!(scheduler.len(), 1);
    }
}
