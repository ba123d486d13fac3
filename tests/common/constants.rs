//! Shared constants for end-to-end tests

// ============================================================================
// Credentials
// ============================================================================

/// Bearer token accepted by the mock API and its push auth endpoint
pub const TEST_TOKEN: &str = "test-api-token";

/// Key prefix of channel authorization signatures issued by the mock
pub const PUSH_APP_KEY: &str = "test-app-key";

// ============================================================================
// Routes
// ============================================================================

pub const JOBS_PATH: &str = "/jobs";
pub const ITEMS_PATH: &str = "/items";
pub const LIMITED_PATH: &str = "/limited";
pub const PUSH_AUTH_PATH: &str = "/push/auth";
pub const PUSH_WS_PATH: &str = "/push/app";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for the server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Interval between server readiness checks (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 10;

/// Upper bound for waiting on a condition in tests (milliseconds)
pub const CONDITION_TIMEOUT_MS: u64 = 5000;
