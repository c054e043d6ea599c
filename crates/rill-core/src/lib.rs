//! Rill Core - push-based effect streams
//!
//! This crate provides the foundation shared by every Rill operator:
//!
//! - [`Sink`]: the two-channel consumer (`on_success` / `on_failure`)
//! - [`Fx`]: a push-based source run inside a [`Scope`]
//! - [`Cause`]: the failure taxonomy (typed failure, defect, interruption)
//! - [`Scope`]: structured-concurrency regions with finalizers
//! - [`Context`]: the immutable ambient type map every subscription carries
//! - [`Clock`]: injectable time for delays and logical ticks
//! - [`RillConfig`]: runtime settings loaded from TOML and `RILL_*` variables
//!
//! Multicast, keyed reconciliation, and versioned values live in
//! `rill-stream`.

#![forbid(unsafe_code)]

/// Failure taxonomy for stream terminations
pub mod cause;

/// Runtime configuration
pub mod config;

/// Ambient context type map
pub mod context;

/// Unified error handling
pub mod errors;

/// Push-based sources and operators
pub mod fx;

/// Running sources to completion
pub mod observe;

/// Structured-concurrency regions
pub mod scope;

/// Consumer interface
pub mod sink;

/// Clock abstraction
pub mod time;

// === Public API Re-exports ===

pub use cause::{Cause, Defect, Exit};
pub use config::{ConfigValidator, RillConfig, ValidationError};
pub use context::{ClockHandle, Context};
pub use errors::{Result, RillError};
pub use fx::{combine_latest, Fx, FxExt, FxRef};
pub use observe::{collect, collect_in, drain, first, observe};
pub use scope::{Scope, ScopeGuard, ScopeId};
pub use sink::{from_fn, FnSink, GuardedSink, Payload, Sink, SinkRef};
pub use time::{Clock, TokioClock};

/// Commonly used items
pub mod prelude {
    pub use crate::cause::{Cause, Defect, Exit};
    pub use crate::context::Context;
    pub use crate::errors::RillError;
    pub use crate::fx::{Fx, FxExt, FxRef};
    pub use crate::scope::Scope;
    pub use crate::sink::{Payload, Sink, SinkRef};
}
