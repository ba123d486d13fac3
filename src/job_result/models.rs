//! Job handles and job results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecError;

/// Identifier returned by a call that starts a long-running job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Extract the handle from a job-initiating response body.
    ///
    /// Accepts both `{ "id": ... }` and `{ "data": { "type": "job", "id": ... } }`.
    pub fn from_body(body: &Value) -> Result<Self, ExecError> {
        let id = body
            .get("data")
            .and_then(|data| data.get("id"))
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ExecError::Decode("response carries no job id".to_string()))?;
        Ok(Self::new(id))
    }
}

/// Status of a job as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Inline(Value),
    /// The payload was too large to push; it must be fetched over REST.
    FetchExternally,
}

/// Outcome of a job. Payload and error can never both be present.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Pending,
    Completed(JobPayload),
    Failed(Value),
}

/// Path a job result was delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Push,
    Poll,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPath::Push => f.write_str("push"),
            DeliveryPath::Poll => f.write_str("poll"),
        }
    }
}

/// Result of a job, as known to the client.
///
/// Terminal results (completed or failed) never change and can be cached by job id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn pending(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Pending,
        }
    }

    pub fn completed(job_id: impl Into<String>, payload: Value) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Completed(JobPayload::Inline(payload)),
        }
    }

    pub fn oversized(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Completed(JobPayload::FetchExternally),
        }
    }

    pub fn failed(job_id: impl Into<String>, error: Value) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: JobOutcome::Failed(error),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.outcome {
            JobOutcome::Pending => JobStatus::Pending,
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// True when the payload has to be fetched over REST before use.
    pub fn needs_external_fetch(&self) -> bool {
        matches!(
            self.outcome,
            JobOutcome::Completed(JobPayload::FetchExternally)
        )
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            JobOutcome::Completed(JobPayload::Inline(payload)) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Value> {
        match &self.outcome {
            JobOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Build a result from its wire record.
    ///
    /// Push events omit the payload when it is too large; a completed push
    /// record without a payload therefore carries the fetch-externally marker.
    pub fn from_record(record: JobResultRecord, path: DeliveryPath) -> Self {
        let outcome = match record.status {
            JobStatus::Pending => JobOutcome::Pending,
            JobStatus::Completed => match record.payload {
                _ if record.payload_too_large => {
                    JobOutcome::Completed(JobPayload::FetchExternally)
                }
                None if path == DeliveryPath::Push => {
                    JobOutcome::Completed(JobPayload::FetchExternally)
                }
                payload => JobOutcome::Completed(JobPayload::Inline(
                    payload.unwrap_or(Value::Null),
                )),
            },
            JobStatus::Failed => JobOutcome::Failed(record.error.unwrap_or(Value::Null)),
        };
        Self {
            job_id: record.id,
            outcome,
        }
    }

    /// Decode the body of `GET /job-results/{id}`.
    pub fn from_rest_body(body: Value) -> Result<Self, ExecError> {
        let record: JobResultRecord = serde_json::from_value(unwrap_document(body))
            .map_err(|e| ExecError::Decode(format!("invalid job result: {}", e)))?;
        Ok(Self::from_record(record, DeliveryPath::Poll))
    }

    /// JSON representation matching the wire format.
    pub fn to_json(&self) -> Value {
        let mut record = serde_json::json!({
            "id": self.job_id,
            "status": self.status().as_str(),
        });
        match &self.outcome {
            JobOutcome::Pending => {}
            JobOutcome::Completed(JobPayload::Inline(payload)) => {
                record["payload"] = payload.clone();
            }
            JobOutcome::Completed(JobPayload::FetchExternally) => {
                record["payload_too_large"] = Value::Bool(true);
            }
            JobOutcome::Failed(error) => {
                record["error"] = error.clone();
            }
        }
        record
    }
}

/// Wire form of a job result, shared by the polling endpoint and push events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultRecord {
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub payload_too_large: bool,
}

/// Strip a JSON:API `data` envelope, flattening `attributes` next to `id`.
fn unwrap_document(body: Value) -> Value {
    let Value::Object(mut root) = body else {
        return body;
    };
    let Some(Value::Object(mut data)) = root.remove("data") else {
        return Value::Object(root);
    };
    if let Some(Value::Object(attributes)) = data.remove("attributes") {
        for (key, value) in attributes {
            data.entry(key).or_insert(value);
        }
    }
    Value::Object(data)
}
