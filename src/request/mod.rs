//! Request execution and retry.

mod executor;
mod retry;
mod retry_policy;

pub use executor::{
    ApiRequest, ApiResponse, HttpExecutor, RequestExecutor, API_VERSION,
    RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
};
pub use retry::execute_with_retry;
pub use retry_policy::{RetryPolicy, DEFAULT_RETRYABLE_ERROR_CODES, DEFAULT_RETRYABLE_STATUSES};

pub use reqwest::Method;
