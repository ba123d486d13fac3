//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{MockApi, Reply};
//!
//! #[tokio::test]
//! async fn test_poll_job() {
//!     let server = MockApi::spawn().await;
//!     server.script_job("job-1", vec![Reply::Completed(serde_json::json!(1))]);
//!
//!     let client = server.client(false);
//!     let result = client.job_result("job-1").await.unwrap();
//!     assert!(result.is_terminal());
//! }
//! ```

mod constants;
mod server;

// Public API - this is what tests import
pub use constants::*;
pub use server::{MockApi, Reply};

use std::time::Duration;

/// Wait until `condition` holds, panicking after `CONDITION_TIMEOUT_MS`.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(description: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(CONDITION_TIMEOUT_MS);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
