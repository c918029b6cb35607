//! # Environment Observer
//!
//! The scheduler never looks at platform APIs directly. It asks an
//! [`EnvironmentObserver`] whether the consumer is in the foreground, whether
//! the network is reachable and when the user last did something, and it
//! listens for transitions of those signals.
//!
//! [`SharedEnvironment`] is the settable implementation: desktop shells, web
//! bridges or tests flip its flags. [`spawn_network_watch`] keeps its network
//! flag honest by periodically opening a TCP connection to a well-known host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lock_or_recover;
use crate::configs::PollingConfig;

/// A transition of one of the environment signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    /// The consumer became visible.
    Foreground,
    /// The consumer was hidden.
    Background,
    /// Connectivity came back.
    NetworkUp,
    /// Connectivity was lost.
    NetworkDown,
    /// The user interacted again after a period of inactivity.
    UserActive,
}

/// Capability interface over platform signals.
pub trait EnvironmentObserver: Send + Sync {
    /// True while the consumer is visible.
    fn is_foreground(&self) -> bool;
    /// True while the network is believed reachable.
    fn is_network_up(&self) -> bool;
    /// Time of the last observed user interaction, if any was ever observed.
    fn last_user_activity_at(&self) -> Option<Instant>;
    /// Stream of signal transitions.
    fn events(&self) -> broadcast::Receiver<EnvironmentEvent>;
}

/// Settable environment that broadcasts transitions.
pub struct SharedEnvironment {
    foreground: AtomicBool,
    network_up: AtomicBool,
    last_activity: Mutex<Option<Instant>>,
    inactivity_threshold: Duration,
    events: broadcast::Sender<EnvironmentEvent>,
}

impl SharedEnvironment {
    /// Starts foregrounded, online and with no recorded activity.
    pub fn new(inactivity_threshold: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            foreground: AtomicBool::new(true),
            network_up: AtomicBool::new(true),
            last_activity: Mutex::new(None),
            inactivity_threshold,
            events,
        }
    }

    /// Environment whose `UserActive` events use the same inactivity threshold
    /// as a scheduler built from `config`.
    pub fn for_polling(config: &PollingConfig) -> Self {
        Self::new(config.inactivity_threshold())
    }

    /// Threshold after which the user counts as inactive.
    pub fn inactivity_threshold(&self) -> Duration {
        self.inactivity_threshold
    }

    /// Records a visibility change. Emits an event only on an actual transition.
    pub fn set_foreground(&self, foreground: bool) {
        if self.foreground.swap(foreground, Ordering::SeqCst) != foreground {
            log::debug!("[env] foreground={}", foreground);
            self.emit(if foreground {
                EnvironmentEvent::Foreground
            } else {
                EnvironmentEvent::Background
            });
        }
    }

    /// Records a connectivity change. Emits an event only on an actual transition.
    pub fn set_network_up(&self, up: bool) {
        if self.network_up.swap(up, Ordering::SeqCst) != up {
            log::info!("[env] network {}", if up { "up" } else { "down" });
            self.emit(if up {
                EnvironmentEvent::NetworkUp
            } else {
                EnvironmentEvent::NetworkDown
            });
        }
    }

    /// Marks the user as active now. Emits `UserActive` when waking from inactivity.
    pub fn record_user_activity(&self) {
        let now = Instant::now();
        let was_inactive = {
            let mut last = lock_or_recover(&self.last_activity);
            let was_inactive = is_stale(*last, now, self.inactivity_threshold);
            *last = Some(now);
            was_inactive
        };
        if was_inactive {
            self.emit(EnvironmentEvent::UserActive);
        }
    }

    /// True when activity was observed once but not within the threshold.
    pub fn is_user_inactive(&self) -> bool {
        is_stale(
            *lock_or_recover(&self.last_activity),
            Instant::now(),
            self.inactivity_threshold,
        )
    }

    fn emit(&self, event: EnvironmentEvent) {
        // No receivers is fine: nobody is scheduling yet.
        let _ = self.events.send(event);
    }
}

impl Default for SharedEnvironment {
    fn default() -> Self {
        Self::for_polling(&PollingConfig::default())
    }
}

impl EnvironmentObserver for SharedEnvironment {
    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn is_network_up(&self) -> bool {
        self.network_up.load(Ordering::SeqCst)
    }

    fn last_user_activity_at(&self) -> Option<Instant> {
        *lock_or_recover(&self.last_activity)
    }

    fn events(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.events.subscribe()
    }
}

/// Activity is stale only if some was seen and it is older than `threshold`.
/// Never having seen activity means "no signal", which counts as active.
pub fn is_stale(last: Option<Instant>, now: Instant, threshold: Duration) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) > threshold,
        None => false,
    }
}

/// Periodically dials `address` over TCP and mirrors reachability into `env`.
pub fn spawn_network_watch(
    env: Arc<SharedEnvironment>,
    address: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("[env] probing {} every {:?}", address, interval);
        loop {
            let reachable = check_connection(&address, Duration::from_secs(3)).await;
            env.set_network_up(reachable);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

async fn check_connection(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
