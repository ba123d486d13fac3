//! Job handles, job results, and fetching them.

mod cache;
mod fetcher;
mod models;

pub use cache::ResultCache;
pub use fetcher::{job_result_path, JobResultFetcher};
pub use models::{
    DeliveryPath, JobHandle, JobOutcome, JobPayload, JobResult, JobResultRecord, JobStatus,
};
