//! Rill Stream - multicast, keyed reconciliation and versioned values
//!
//! Built on the `rill-core` contract:
//!
//! - [`Subject`]: a sink and source at once, fanning values out to every
//!   subscriber with optional hold/replay buffering
//! - [`Share`]: one ref-counted run of a source shared by all subscribers
//!   (`multicast`, `hold`, `replay`)
//! - [`ValueRef`]: an updatable value observable as a stream
//! - [`keyed`]: per-key sub-streams reconciled from ordered sequences
//! - [`Versioned`]: a value that can be pushed as changes or pulled on demand,
//!   with version-keyed memoization

#![forbid(unsafe_code)]

/// Updatable references
pub mod cell;

/// Keyed reconciliation
pub mod keyed;

/// Ref-counted sharing
pub mod share;

/// Multicast hub
pub mod subject;

/// Push/pull values
pub mod versioned;

pub use cell::ValueRef;
pub use keyed::{keyed, KeyedOptions};
pub use share::{hold, multicast, replay, share, MulticastExt, Share};
pub use subject::{BufferPolicy, Subject, Subscription};
pub use versioned::{struct_of, tuple, Versioned, VersionedSource};
