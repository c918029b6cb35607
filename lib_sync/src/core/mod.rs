//! # Core Module
//!
//! Building blocks shared by every sync component.
//!
//! ## Core Components:
//!
//! - **`registry`**: Reference-counted channel registry. Many listeners share
//!   one push subscription; the server hears about the first subscribe and the
//!   last unsubscribe only.
//!
//! - **`dispatcher`**: Zero-copy fan-out of decoded notifications to in-process
//!   listeners, keyed by topic.
//!
//! - **`clock`**: Wall-clock capability for cache timestamps, swappable in tests.
//!
//! - **`environment`**: Foreground, network and user-activity signals that the
//!   polling scheduler reacts to.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::{Mutex, MutexGuard};

/// Wall-clock abstraction.
pub mod clock;
/// Zero-copy notification fan-out.
pub mod dispatcher;
/// Platform signal observer.
pub mod environment;
/// Reference-counted subscription registry.
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{ListenerTopic, NotificationDispatcher, NotificationListener};
pub use environment::{EnvironmentEvent, EnvironmentObserver, SharedEnvironment};
pub use registry::{Release, Subscription, SubscriptionRegistry};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
