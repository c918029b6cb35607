//! # Operation Mode
//!
//! Watches the push transport and decides whether the coordinator runs on
//! push updates or has to fall back to periodic full refreshes.

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ingestors::push_wss::{ConnectionState, ConnectionStatus};

/// Operational states for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    /// Push transport is connected; polling runs at its normal cadence.
    Streaming,
    /// Push transport gave up: fixed-interval fallback refreshes run and
    /// resources are flagged as degraded.
    FailoverPolling,
    /// Push transport was never opened or was closed on purpose.
    Idle,
}

/// Mode implied by a transport status. Transitional statuses keep the
/// previous mode.
pub fn mode_for(status: ConnectionStatus, previous: OperationMode) -> OperationMode {
    match status {
        ConnectionStatus::Connected => OperationMode::Streaming,
        ConnectionStatus::Failed => OperationMode::FailoverPolling,
        ConnectionStatus::Disconnected => OperationMode::Idle,
        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => previous,
    }
}

/// Follows `states` and publishes the mode on `mode_tx` until `cancel` fires.
pub(crate) fn spawn_mode_monitor(
    mut states: watch::Receiver<ConnectionState>,
    mode_tx: watch::Sender<OperationMode>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = states.borrow_and_update().clone();
            let current = *mode_tx.borrow();
            let next = mode_for(state.status, current);

            if next != current {
                match next {
                    OperationMode::FailoverPolling => log::warn!(
                        "[sync] push transport failed after {} attempts ({}); running in degraded mode with fallback refreshes",
                        state.reconnect_attempts,
                        state
                            .last_error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no error recorded".to_string())
                    ),
                    _ => log::info!("[sync] transitioning mode: {:?} -> {:?}", current, next),
                }
                mode_tx.send_replace(next);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("[sync] mode monitor stopped");
    })
}
