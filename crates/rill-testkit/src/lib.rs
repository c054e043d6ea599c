//! Rill Testing Infrastructure
//!
//! Shared helpers for exercising streams in unit and integration tests:
//! sinks that record what they receive, sources whose lifecycle can be
//! observed and driven by hand, and opt-in tracing output.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! Add this to your crate's `Cargo.toml` dev-dependencies:
//! ```toml
//! [dev-dependencies]
//! rill-testkit = { workspace = true }
//! ```
//!
//! Then in your tests:
//! ```rust,ignore
//! use rill_testkit::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn my_test() {
//!     init_test_tracing();
//!     let probe = ProbeSource::<u32, String>::new();
//!     let sink = RecordingSink::<u32, String>::new();
//!     // ... attach `sink` to something built on `probe`
//! }
//! ```

/// Recording sinks
pub mod sinks;
/// Hand-driven sources
pub mod sources;

pub use sinks::{Event, RecordingSink};
pub use sources::ProbeSource;

use std::time::Duration;

/// Install a fmt subscriber filtered by `RUST_LOG`. Safe to call from every
/// test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run until they block. Intended for paused-clock tests,
/// where the sleep completes as soon as every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
