//! Fakes and fixtures for benchfleet's integration tests.
//!
//! Everything here talks to a shared `MockFileSystem`, so a test can lay out
//! experiment directories, drive the scheduler through `FakeShell` and
//! `FakeArtifactSource`, and then inspect the markers it left behind.

pub mod builders;
pub mod fake_shell;
pub mod fake_source;

pub use builders::{ConfigFileBuilder, ExperimentFixture};
pub use fake_shell::FakeShell;
pub use fake_source::FakeArtifactSource;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route scheduler logs through the test writer. `RUST_LOG` overrides the
/// default of `benchfleet=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("benchfleet=debug,warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail the test instead of hanging when a scheduler loop never returns.
pub async fn with_timeout<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("test timed out after {TEST_TIMEOUT:?}"))
}
