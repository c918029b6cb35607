//! # Update Sources
//!
//! The two network-facing update sources of the sync layer.
//!
//! ## Contained Modules:
//! - **`push_wss`**: the push transport client. One persistent connection with
//!   heartbeat, reconnect backoff, a subscription registry and typed dispatch.
//! - **`polling`**: the adaptive pull scheduler. Independent self-rescheduling
//!   tasks with backoff, dependency gates and environment reactivity.
//! - **`connector`**: how the transport opens sessions (WebSocket or in-process).
//! - **`frames`**: the JSON wire envelope and decoded notifications.
//! - **`backoff`**: reconnect delay policy and the shared jitter helper.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reconnect delay policy.
pub mod backoff;
/// Session connectors.
pub mod connector;
/// Wire frames.
pub mod frames;
/// Adaptive polling scheduler.
pub mod polling;
/// Push transport client.
pub mod push_wss;

pub use backoff::ReconnectPolicy;
pub use connector::{ChannelConnector, Connector, ServerAcceptor, ServerEnd, WssConnector};
pub use frames::{Action, Frame, NotificationMessage};
pub use polling::{PollTask, PollingScheduler, Priority, TaskPhase, TaskStatus};
pub use push_wss::{ConnectionState, ConnectionStatus, TransportClient};
