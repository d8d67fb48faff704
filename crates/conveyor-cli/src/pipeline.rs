//! Lead pipeline - 9 ステージ（各ステージは薄い冪等 handler）
//!
//! # フロー
//! discover → enrich → features → score → draft → send → feedback
//! → labels → retrain
//!
//! - score が `DRAFT_THRESHOLD` 未満なら run は score で終わる
//! - 未対応の enrichment provider は失敗レコードを書いて `TerminalError`

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use conveyor_core::app::{AppBuilder, BuildError};
use conveyor_core::domain::{InvalidJobType, JobType, NextStage, StageOutcome};
use conveyor_core::impls::InMemoryUpsertStore;
use conveyor_core::policy::{RetryPolicy, RetryPolicyTable};
use conveyor_core::ports::UpsertByNaturalKey;
use conveyor_core::typed::{Job, StageContext, StageHandler};

pub const DRAFT_THRESHOLD: u32 = 50;
/// Enrichment providers with a client behind them.
pub const PROVIDERS: [&str; 2] = ["clearbit", "apollo"];
pub const SCORING_MODEL: &str = "lead-score";

pub const JOB_TYPES: [&str; 9] = [
    DiscoverLeads::TYPE,
    EnrichLead::TYPE,
    ExtractFeatures::TYPE,
    ComputeScore::TYPE,
    DraftMessage::TYPE,
    SendMessage::TYPE,
    CollectFeedback::TYPE,
    UpdateLabels::TYPE,
    RetrainModel::TYPE,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverLeads {
    pub region: String,
    pub limit: u32,
}

impl Job for DiscoverLeads {
    const TYPE: &'static str = "lead.discover";

    fn validate(&self) -> Result<(), String> {
        if self.region.trim().is_empty() {
            return Err("region must not be empty".into());
        }
        if self.limit == 0 {
            return Err("limit must be positive".into());
        }
        Ok(())
    }

    fn natural_key(&self) -> String {
        self.region.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichLead {
    pub lead_id: String,
    pub provider: String,
}

impl Job for EnrichLead {
    const TYPE: &'static str = "enrichment.run";

    fn natural_key(&self) -> String {
        format!("{}:{}", self.lead_id, self.provider)
    }
}

/// Stages that only carry the lead they act on.
macro_rules! lead_job {
    ($name:ident, $type:literal) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            pub lead_id: String,
        }

        impl Job for $name {
            const TYPE: &'static str = $type;

            fn validate(&self) -> Result<(), String> {
                if self.lead_id.is_empty() {
                    return Err("leadId must not be empty".into());
                }
                Ok(())
            }

            fn natural_key(&self) -> String {
                self.lead_id.clone()
            }
        }
    };
}

lead_job!(ExtractFeatures, "features.extract");
lead_job!(ComputeScore, "score.compute");
lead_job!(DraftMessage, "message.draft");
lead_job!(SendMessage, "message.send");
lead_job!(CollectFeedback, "feedback.collect");
lead_job!(UpdateLabels, "labels.update");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrainModel {
    pub model: String,
}

impl Job for RetrainModel {
    const TYPE: &'static str = "model.retrain";

    fn natural_key(&self) -> String {
        self.model.clone()
    }
}

/// What a stage wrote for one natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub run_id: String,
    pub detail: String,
}

/// Side-effect storage, keyed `<job type>:<natural key>`.
#[derive(Debug, Clone, Default)]
pub struct PipelineRecords {
    records: InMemoryUpsertStore<StageRecord>,
}

impl PipelineRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find<J: Job>(&self, natural_key: &str) -> Option<StageRecord> {
        self.records
            .find(&format!("{}:{natural_key}", J::TYPE))
            .await
            .ok()
            .flatten()
    }

    pub async fn len(&self) -> usize {
        self.records.len().await
    }

    async fn write<J: Job>(
        &self,
        job: &J,
        ctx: &StageContext,
        detail: impl Into<String>,
    ) -> Result<(), StageOutcome> {
        let key = format!("{}:{}", J::TYPE, job.natural_key());
        let record = StageRecord {
            run_id: ctx.run_id().to_string(),
            detail: detail.into(),
        };
        match self.records.upsert(&key, record).await {
            Ok(result) => {
                info!(key = %key, result = ?result, redelivery = ctx.is_redelivery(), "stage record written");
                Ok(())
            }
            Err(e) => Err(StageOutcome::retry(e.to_string())),
        }
    }
}

/// Deterministic 0..100 score so reruns agree.
pub fn score_of(lead_id: &str) -> u32 {
    lead_id.bytes().map(u32::from).sum::<u32>() % 100
}

#[derive(Clone)]
pub struct Stages {
    records: PipelineRecords,
    provider: String,
}

impl Stages {
    pub fn new(records: PipelineRecords) -> Self {
        Self {
            records,
            provider: "clearbit".to_string(),
        }
    }
}

#[async_trait]
impl StageHandler<DiscoverLeads> for Stages {
    async fn handle(&self, job: DiscoverLeads, ctx: &StageContext) -> StageOutcome {
        let leads: Vec<String> = (1..=job.limit)
            .map(|n| format!("{}-lead-{n}", job.region))
            .collect();
        if let Err(retry) = self
            .records
            .write(&job, ctx, format!("{} leads", leads.len()))
            .await
        {
            return retry;
        }

        let mut outcome = StageOutcome::done();
        for lead_id in leads {
            let next = EnrichLead {
                lead_id,
                provider: self.provider.clone(),
            };
            match NextStage::of(&next) {
                Ok(stage) => outcome = outcome.with_next(stage),
                Err(e) => return StageOutcome::terminal(e.to_string()),
            }
        }
        outcome
    }
}

#[async_trait]
impl StageHandler<EnrichLead> for Stages {
    async fn handle(&self, job: EnrichLead, ctx: &StageContext) -> StageOutcome {
        // No retry can make an unknown provider work; record the failure and end the run.
        if !PROVIDERS.contains(&job.provider.as_str()) {
            let reason = format!("unsupported enrichment provider '{}'", job.provider);
            if let Err(retry) = self.records.write(&job, ctx, format!("failed: {reason}")).await {
                return retry;
            }
            return StageOutcome::terminal(reason);
        }
        if let Err(retry) = self.records.write(&job, ctx, &job.provider).await {
            return retry;
        }
        StageOutcome::advance(&ExtractFeatures {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<ExtractFeatures> for Stages {
    async fn handle(&self, job: ExtractFeatures, ctx: &StageContext) -> StageOutcome {
        let detail = format!("name_len={}", job.lead_id.len());
        if let Err(retry) = self.records.write(&job, ctx, detail).await {
            return retry;
        }
        StageOutcome::advance(&ComputeScore {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<ComputeScore> for Stages {
    async fn handle(&self, job: ComputeScore, ctx: &StageContext) -> StageOutcome {
        let score = score_of(&job.lead_id);
        if let Err(retry) = self.records.write(&job, ctx, score.to_string()).await {
            return retry;
        }
        if score < DRAFT_THRESHOLD {
            info!(lead_id = %job.lead_id, score, "below draft threshold; run ends here");
            return StageOutcome::done();
        }
        StageOutcome::advance(&DraftMessage {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<DraftMessage> for Stages {
    async fn handle(&self, job: DraftMessage, ctx: &StageContext) -> StageOutcome {
        let draft = format!("Hello from {}", job.lead_id);
        if let Err(retry) = self.records.write(&job, ctx, draft).await {
            return retry;
        }
        StageOutcome::advance(&SendMessage {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<SendMessage> for Stages {
    async fn handle(&self, job: SendMessage, ctx: &StageContext) -> StageOutcome {
        // A redelivery finds the send record and does not send twice.
        if self.records.find::<SendMessage>(&job.lead_id).await.is_some() {
            info!(lead_id = %job.lead_id, "message already sent");
        } else if let Err(retry) = self.records.write(&job, ctx, "sent").await {
            return retry;
        }
        StageOutcome::advance(&CollectFeedback {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<CollectFeedback> for Stages {
    async fn handle(&self, job: CollectFeedback, ctx: &StageContext) -> StageOutcome {
        let replied = score_of(&job.lead_id) % 2 == 0;
        let detail = if replied { "replied" } else { "no_reply" };
        if let Err(retry) = self.records.write(&job, ctx, detail).await {
            return retry;
        }
        StageOutcome::advance(&UpdateLabels {
            lead_id: job.lead_id,
        })
    }
}

#[async_trait]
impl StageHandler<UpdateLabels> for Stages {
    async fn handle(&self, job: UpdateLabels, ctx: &StageContext) -> StageOutcome {
        let label = match self.records.find::<CollectFeedback>(&job.lead_id).await {
            Some(feedback) => feedback.detail,
            None => "unknown".to_string(),
        };
        if let Err(retry) = self.records.write(&job, ctx, label).await {
            return retry;
        }
        // One live retrain per model, however many leads get relabelled.
        StageOutcome::advance(&RetrainModel {
            model: SCORING_MODEL.to_string(),
        })
    }
}

#[async_trait]
impl StageHandler<RetrainModel> for Stages {
    async fn handle(&self, job: RetrainModel, ctx: &StageContext) -> StageOutcome {
        match self.records.write(&job, ctx, "retrained").await {
            Ok(()) => StageOutcome::done(),
            Err(retry) => retry,
        }
    }
}

/// Register all nine stages against `stages`.
pub fn register(builder: AppBuilder, stages: &Stages) -> Result<AppBuilder, BuildError> {
    builder
        .register::<DiscoverLeads, _>(stages.clone())?
        .register::<EnrichLead, _>(stages.clone())?
        .register::<ExtractFeatures, _>(stages.clone())?
        .register::<ComputeScore, _>(stages.clone())?
        .register::<DraftMessage, _>(stages.clone())?
        .register::<SendMessage, _>(stages.clone())?
        .register::<CollectFeedback, _>(stages.clone())?
        .register::<UpdateLabels, _>(stages.clone())?
        .register::<RetrainModel, _>(stages.clone())
}

/// Used when the config file carries no `[policies]`: three retries, 30s
/// doubling, `<type>.dlq`.
pub fn default_policies() -> Result<RetryPolicyTable, InvalidJobType> {
    let mut table = RetryPolicyTable::new();
    for name in JOB_TYPES {
        let job_type = JobType::parse(name)?;
        table.insert(
            job_type.clone(),
            RetryPolicy {
                retry_limit: 3,
                retry_delay: Duration::from_secs(30),
                retry_backoff: true,
                dead_letter: job_type.dead_letter(),
            },
        );
    }
    Ok(table)
}
