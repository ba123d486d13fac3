//! Error taxonomy shared by the request, retry, pagination and job-result layers.
//!
//! Transport outcomes are classified exactly once, by the request executor.
//! Everything downstream only inspects the resulting [`ExecError`] variant.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cancelable::Canceled;
use crate::job_result::JobStatus;

/// A single machine-readable entry of an API error document.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiErrorEntry {
    /// Server-assigned error id, if any.
    pub id: Option<String>,
    /// Machine-readable error code (e.g. "INVALID_FIELD").
    pub code: String,
    /// Path of the offending field, when the error concerns one.
    pub field: Option<String>,
    /// Remaining error details as sent by the server.
    pub details: serde_json::Value,
}

#[derive(Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    data: Vec<ErrorDocumentEntry>,
}

#[derive(Deserialize)]
struct ErrorDocumentEntry {
    id: Option<String>,
    #[serde(default)]
    attributes: ErrorAttributes,
}

#[derive(Deserialize, Default)]
struct ErrorAttributes {
    #[serde(default)]
    code: String,
    #[serde(default)]
    details: serde_json::Value,
}

impl ApiErrorEntry {
    /// Parse the entries of a JSON:API error body.
    ///
    /// Bodies that are not an error document yield no entries.
    pub fn parse_document(body: &[u8]) -> Vec<ApiErrorEntry> {
        let Ok(document) = serde_json::from_slice::<ErrorDocument>(body) else {
            return Vec::new();
        };

        document
            .data
            .into_iter()
            .map(|entry| {
                let field = entry
                    .attributes
                    .details
                    .get("field")
                    .and_then(|f| f.as_str())
                    .map(str::to_string);
                ApiErrorEntry {
                    id: entry.id,
                    code: entry.attributes.code,
                    field,
                    details: entry.attributes.details,
                }
            })
            .collect()
    }
}

/// Outcome of a failed request or job-result operation.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("request timed out")]
    Timeout,

    #[error("API error: status {status}{}", format_codes(.entries))]
    Api {
        status: u16,
        entries: Vec<ApiErrorEntry>,
        /// Server-requested wait before the next attempt (429 responses).
        retry_after: Option<Duration>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation canceled")]
    Canceled,

    #[error("job {job_id} is still pending")]
    StillPending { job_id: String },

    #[error("retries exhausted, last error: {0}")]
    RetriesExhausted(Box<ExecError>),

    #[error("inconsistent results for job {job_id}: push reported {push}, poll reported {poll}")]
    InconsistentJobResult {
        job_id: String,
        push: JobStatus,
        poll: JobStatus,
    },
}

fn format_codes(entries: &[ApiErrorEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let codes: Vec<&str> = entries.iter().map(|e| e.code.as_str()).collect();
    format!(" ({})", codes.join(", "))
}

impl ExecError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ExecError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if this error represents caller-initiated abandonment.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExecError::Canceled)
    }

    /// Returns true if any API error entry carries the given code.
    pub fn has_code(&self, code: &str) -> bool {
        match self {
            ExecError::Api { entries, .. } => entries.iter().any(|e| e.code == code),
            _ => false,
        }
    }
}

impl From<Canceled> for ExecError {
    fn from(_: Canceled) -> Self {
        ExecError::Canceled
    }
}
