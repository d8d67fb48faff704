//! Job trait - 型付き Job の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - natural key による冪等性の単位
//!
//! # 使用例
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct EnrichLead {
//!     lead_id: String,
//!     provider: String,
//! }
//!
//! impl Job for EnrichLead {
//!     const TYPE: &'static str = "enrichment.run";
//!
//!     fn natural_key(&self) -> String {
//!         format!("{}:{}", self.lead_id, self.provider)
//!     }
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::JobType;

/// A typed pipeline job.
///
/// - `Serialize`/`DeserializeOwned`: payloads travel as JSON.
/// - `Send + Sync + 'static`: decoded jobs cross task boundaries.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue name. Lowercase dot-separated, e.g. `lead.discover`.
    const TYPE: &'static str;

    fn job_type() -> JobType {
        JobType::from_static(Self::TYPE)
    }

    /// Business-level checks beyond the JSON shape.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Upstream entity this job acts on. Feeds the singleton key, so it must
    /// be stable across redeliveries of the same logical work.
    fn natural_key(&self) -> String;
}
