//! # Reconciliation
//!
//! Combines the cache, the push transport and the polling scheduler into one
//! reconciled value per tracked resource.
//!
//! ## Contained Modules:
//! - **`engine`**: [`SyncCoordinator`] and the per-resource task that applies
//!   every update in sequence order.
//! - **`resource`**: resource descriptors, fetch types and the consumer handle.
//! - **`merge`**: how a push notification changes the current value.
//! - **`throttle`**: trailing-window coalescing of routine invalidations.
//! - **`fallback`**: operation mode derived from the transport state.
//! - **`state`**: the consumer-visible snapshot and counters.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod engine;
pub mod fallback;
pub mod merge;
pub mod resource;
pub mod state;
pub mod throttle;

pub use engine::SyncCoordinator;
pub use fallback::OperationMode;
pub use merge::MergeOutcome;
pub use resource::{
    Classifier, FetchContext, Fetched, ResourceDescriptor, ResourceFetcher, ResourceHandle,
    UpdateClass,
};
pub use state::{ResourceSnapshot, SyncStats, UpdateSource};
