//! Test utilities.
//!
//! - [`MockManagementApi`] - a recording stand-in for the broker management API
//! - [`init_tracing`] - install a test-friendly tracing subscriber once
//!
//! # Example
//!
//! ```rust,ignore
//! use rpc_harness_core::testing::{init_tracing, MockManagementApi};
//!
//! #[tokio::test]
//! async fn test_namespace_roundtrip() {
//!     init_tracing();
//!     let mock = MockManagementApi::start().await.unwrap();
//!     // point a ManagementClient at mock.base_uri()
//! }
//! ```

pub mod mock_management;

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

pub use mock_management::{MockManagementApi, RecordedRequest};

static TRACING: Once = Once::new();

/// Install a subscriber that writes through the test harness's capture.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}
