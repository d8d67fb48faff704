//! PayloadCodec - 型付き Job と JSON payload（run context 付き）の相互変換
//!
//! Stage payloads are the job body plus two reserved fields, `runId` and
//! `correlationId`. Encoding injects them, decoding strips them before the
//! job type sees the object.

use serde_json::{Map, Value};

use super::job::Job;
use crate::domain::RunContext;

const RUN_ID: &str = "runId";
const CORRELATION_ID: &str = "correlationId";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload for '{0}' must be a JSON object")]
    NotAnObject(String),

    #[error("payload for '{job_type}' does not decode: {source}")]
    Decode {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload for '{job_type}' failed validation: {reason}")]
    Invalid { job_type: String, reason: String },

    #[error("job '{job_type}' does not encode: {source}")]
    Encode {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a typed job and attach `ctx`.
pub fn encode<J: Job>(job: &J, ctx: &RunContext) -> Result<Value, CodecError> {
    let body = serde_json::to_value(job).map_err(|source| CodecError::Encode {
        job_type: J::TYPE.to_string(),
        source,
    })?;
    attach_context(J::TYPE, body, ctx)
}

/// Attach `ctx` to an already-encoded job body, replacing any previous context.
pub fn attach_context(job_type: &str, body: Value, ctx: &RunContext) -> Result<Value, CodecError> {
    let Value::Object(mut map) = body else {
        return Err(CodecError::NotAnObject(job_type.to_string()));
    };
    map.insert(RUN_ID.to_string(), Value::String(ctx.run_id.clone()));
    map.insert(
        CORRELATION_ID.to_string(),
        Value::String(ctx.correlation_id.clone()),
    );
    Ok(Value::Object(map))
}

/// Read the run context carried by a payload, if complete.
pub fn read_context(payload: &Value) -> Option<RunContext> {
    let map = payload.as_object()?;
    Some(RunContext {
        run_id: map.get(RUN_ID)?.as_str()?.to_string(),
        correlation_id: map.get(CORRELATION_ID)?.as_str()?.to_string(),
    })
}

/// Decode a typed job, ignoring the reserved context fields, and run `Job::validate`.
pub fn decode<J: Job>(payload: Value) -> Result<J, CodecError> {
    let Value::Object(map) = payload else {
        return Err(CodecError::NotAnObject(J::TYPE.to_string()));
    };
    let body: Map<String, Value> = map
        .into_iter()
        .filter(|(k, _)| k != RUN_ID && k != CORRELATION_ID)
        .collect();

    let job: J = serde_json::from_value(Value::Object(body)).map_err(|source| CodecError::Decode {
        job_type: J::TYPE.to_string(),
        source,
    })?;
    job.validate().map_err(|reason| CodecError::Invalid {
        job_type: J::TYPE.to_string(),
        reason,
    })?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    struct DraftMessage {
        lead_id: String,
        template: String,
    }

    impl Job for DraftMessage {
        const TYPE: &'static str = "message.draft";

        fn validate(&self) -> Result<(), String> {
            if self.template.is_empty() {
                return Err("template must not be empty".into());
            }
            Ok(())
        }

        fn natural_key(&self) -> String {
            self.lead_id.clone()
        }
    }

    fn ctx() -> RunContext {
        RunContext::start("run-5", &JobType::parse("lead.discover").unwrap())
    }

    #[test]
    fn encode_injects_context_fields() {
        let job = DraftMessage {
            lead_id: "lead-1".into(),
            template: "intro".into(),
        };
        let payload = encode(&job, &ctx()).unwrap();

        assert_eq!(payload["leadId"], "lead-1");
        assert_eq!(payload["runId"], "run-5");
        assert_eq!(payload["correlationId"], "run-5/lead.discover");
        assert_eq!(read_context(&payload), Some(ctx()));
    }

    #[test]
    fn decode_strips_context_for_strict_jobs() {
        let payload = json!({
            "leadId": "lead-1",
            "template": "intro",
            "runId": "run-5",
            "correlationId": "run-5/lead.discover",
        });
        let job: DraftMessage = decode(payload).unwrap();
        assert_eq!(job.lead_id, "lead-1");
    }

    #[test]
    fn decode_reports_shape_and_validation_errors() {
        let err = decode::<DraftMessage>(json!({"leadId": 7})).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));

        let err = decode::<DraftMessage>(json!({"leadId": "lead-1", "template": ""})).unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));

        let err = decode::<DraftMessage>(json!(["lead-1"])).unwrap_err();
        assert!(matches!(err, CodecError::NotAnObject(_)));
    }

    #[test]
    fn context_is_absent_when_incomplete() {
        assert_eq!(read_context(&json!({"runId": "run-1"})), None);
        assert_eq!(read_context(&json!("run-1")), None);
    }
}
