//! Job Result Client Library
//!
//! Delivers the results of long-running server-side jobs: push notifications
//! when available, REST polling otherwise, with retries, ordered concurrent
//! pagination and explicit cancellation.

pub mod cancelable;
pub mod client;
pub mod config;
pub mod error;
pub mod job_result;
pub mod pagination;
pub mod request;
pub mod subscription;

// Re-export commonly used types for convenience
pub use cancelable::{cancelable, spawn_cancelable, CancelHandle, Canceled};
pub use client::Client;
pub use config::{ClientConfig, CliConfig, FileConfig};
pub use error::{ApiErrorEntry, ExecError};
pub use job_result::{JobHandle, JobOutcome, JobPayload, JobResult, JobResultFetcher, JobStatus};
pub use pagination::{iterate_pages, Page, PageCursor, PageIterator};
pub use request::{execute_with_retry, ApiRequest, ApiResponse, RequestExecutor, RetryPolicy};
pub use subscription::{ChannelTarget, Subscription, SubscriptionRegistry};
