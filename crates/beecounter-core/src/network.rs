//! Network link supervision.
//!
//! Losing WiFi triggers a reconnect attempt with a fixed budget; if the link
//! is still down when the budget runs out, the device restarts.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::scheduler::PeriodicTask;
use crate::storage::ErrorLog;

pub trait NetworkLink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Kick off a reconnect. Must return promptly; progress is observed
    /// through `is_connected`.
    fn begin_reconnect(&self) -> Result<(), String>;

    /// Signal strength in dBm, when connected.
    fn rssi(&self) -> Option<i32>;
}

/// Process-level control.
pub trait SystemControl: Send + Sync {
    /// Restart the device (or the process on the host). May return on hosts
    /// where the restart is carried out asynchronously.
    fn restart(&self, reason: &str);

    /// Make `tz` (a POSIX TZ string) the local time zone, so error log
    /// stamps and other local times follow it.
    fn apply_timezone(&self, tz: &str) {
        crate::clock::set_local_timezone(tz);
    }
}

/// Link that is always up (wired hosts, tests).
pub struct AlwaysConnected;

impl NetworkLink for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }

    fn begin_reconnect(&self) -> Result<(), String> {
        Ok(())
    }

    fn rssi(&self) -> Option<i32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting { since_ms: u64 },
    /// Restart requested; nothing more to do.
    Restarting,
}

/// Scheduler task that supervises the link.
pub struct ConnectivityWatchdog {
    link: Arc<dyn NetworkLink>,
    system: Arc<dyn SystemControl>,
    error_log: Arc<ErrorLog>,
    timeout_ms: u64,
    state: LinkState,
}

impl ConnectivityWatchdog {
    pub fn new(
        link: Arc<dyn NetworkLink>,
        system: Arc<dyn SystemControl>,
        error_log: Arc<ErrorLog>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            link,
            system,
            error_log,
            timeout_ms,
            state: LinkState::Connected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }
}

impl PeriodicTask for ConnectivityWatchdog {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn period_ms(&self) -> u64 {
        500
    }

    fn run(&mut self, now_ms: u64) {
        let connected = self.link.is_connected();
        self.state = match (self.state, connected) {
            (LinkState::Restarting, _) => LinkState::Restarting,
            (LinkState::Connected, true) => LinkState::Connected,
            (LinkState::Reconnecting { since_ms }, true) => {
                info!(after_ms = now_ms.saturating_sub(since_ms), "WiFi reconnected");
                LinkState::Connected
            }
            (LinkState::Connected, false) => {
                warn!("WiFi connection lost, reconnecting");
                if let Err(e) = self.link.begin_reconnect() {
                    warn!(error = %e, "reconnect request failed");
                }
                LinkState::Reconnecting { since_ms: now_ms }
            }
            (LinkState::Reconnecting { since_ms }, false) => {
                if now_ms.saturating_sub(since_ms) >= self.timeout_ms {
                    let reason = format!(
                        "Failed to reconnect to WiFi after {} seconds",
                        self.timeout_ms / 1000
                    );
                    error!("{}; restarting", reason);
                    if let Err(e) = self.error_log.append(&reason) {
                        warn!(error = %e, "could not write error log");
                    }
                    self.system.restart(&reason);
                    LinkState::Restarting
                } else {
                    LinkState::Reconnecting { since_ms }
                }
            }
        };
    }
}
