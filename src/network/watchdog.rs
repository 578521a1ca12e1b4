//! Connection liveness watchdog
//!
//! Let `T` be the connection timeout. Every `T/2` the watchdog looks at the
//! time since the last inbound frame: past `T` it sends an echo probe, past
//! `2T` it also marks the connection unresponsive. It never closes a
//! connection; an answer to the probe makes it responsive again.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::Transport;

/// What a watchdog check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Idle,
    Echo,
    Unresponsive,
}

/// Decide the action for the time elapsed since the connection was last alive
pub fn evaluate(elapsed: Duration, timeout: Duration) -> WatchdogAction {
    if elapsed > timeout * 2 {
        WatchdogAction::Unresponsive
    } else if elapsed > timeout {
        WatchdogAction::Echo
    } else {
        WatchdogAction::Idle
    }
}

/// Run the watchdog until the connection is closed or dropped
pub(crate) fn spawn(transport: Weak<Transport>, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(transport) = transport.upgrade() else {
                break;
            };
            if transport.is_closed() {
                break;
            }
            match evaluate(transport.time_since_alive(), timeout) {
                WatchdogAction::Idle => {}
                WatchdogAction::Echo => {
                    let _ = transport.send_echo();
                }
                WatchdogAction::Unresponsive => {
                    transport.mark_unresponsive();
                    // keep probing so an answer can bring it back
                    let _ = transport.send_echo();
                }
            }
        }
        tracing::debug!("Watchdog stopped");
    })
}
