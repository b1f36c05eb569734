//! Structured events emitted by the reconciler
//!
//! The reconciler reports every decision through an [`EventSink`] instead of
//! logging directly, so its control flow can be asserted on in tests.
//! [`TracingSink`] is the default and forwards events to `tracing`.

use crate::sandbox::ProcessStatus;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconciliation states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileState {
    NoTrackedProcess,
    TrackedHealthy,
    TrackedUnhealthy,
    UntrackedHealthy,
    StartingNew,
    Ready,
    Failed,
}

/// Something the reconciler observed or did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconcileEvent {
    /// The state machine entered a new state
    Transition { state: ReconcileState },
    /// Listing processes failed; treated as "no tracked process"
    EnumerationFailed { error: String },
    /// A gateway process was found in the sandbox's tracker
    TrackedProcessFound {
        process_id: String,
        status: ProcessStatus,
    },
    /// Waiting for the gateway port
    WaitingForPort { port: u16, timeout_ms: u64 },
    /// The tracked process is a launch that a lease holder already gave up on
    AbandonedLaunchFound { process_id: String },
    /// A stale gateway could not be killed
    KillFailed { process_id: String, error: String },
    /// Result of a single reachability probe
    PortProbed { port: u16, reachable: bool },
    /// Waiting for another caller's launch lease
    LeaseContended { sandbox_id: String },
    /// A new gateway process was started
    Launched {
        process_id: String,
        command: String,
        env_keys: Vec<String>,
    },
    /// The sandbox refused to start the gateway
    LaunchFailed { command: String, error: String },
    /// `wait_for_port` on a fresh gateway failed
    StartupWaitFailed { process_id: String, error: String },
    /// Output of a newly launched gateway once it became reachable
    ReadyLogs {
        process_id: String,
        stdout: String,
        stderr: String,
    },
    /// Logs captured from a gateway that failed to start
    StartupLogs { stdout: String, stderr: String },
    /// Logs could not be fetched while handling a startup failure
    LogsUnavailable { process_id: String, error: String },
}

impl ReconcileEvent {
    pub fn transition(state: ReconcileState) -> Self {
        ReconcileEvent::Transition { state }
    }

    pub(crate) fn waiting_for_port(port: u16, timeout: Duration) -> Self {
        ReconcileEvent::WaitingForPort {
            port,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Receiver for reconciliation events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ReconcileEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ReconcileEvent) {
        match event {
            ReconcileEvent::Transition { state } => {
                debug!(?state, "Gateway reconcile state");
            }
            ReconcileEvent::EnumerationFailed { error } => {
                warn!(%error, "Could not list processes");
            }
            ReconcileEvent::TrackedProcessFound { process_id, status } => {
                info!(process_id, %status, "Found existing gateway process");
            }
            ReconcileEvent::WaitingForPort { port, timeout_ms } => {
                info!(port, timeout_ms, "Waiting for gateway port");
            }
            ReconcileEvent::AbandonedLaunchFound { process_id } => {
                info!(process_id, "Gateway launch was already abandoned, replacing it");
            }
            ReconcileEvent::KillFailed { process_id, error } => {
                warn!(process_id, %error, "Failed to kill unresponsive gateway");
            }
            ReconcileEvent::PortProbed { port, reachable } => {
                if reachable {
                    info!(port, "Gateway port is reachable");
                } else {
                    debug!(port, "Gateway port is not reachable");
                }
            }
            ReconcileEvent::LeaseContended { sandbox_id } => {
                info!(sandbox_id, "Another caller is launching the gateway, waiting");
            }
            ReconcileEvent::Launched {
                process_id,
                command,
                env_keys,
            } => {
                info!(process_id, command, ?env_keys, "Gateway process started");
            }
            ReconcileEvent::LaunchFailed { command, error } => {
                error!(command, %error, "Failed to start gateway process");
            }
            ReconcileEvent::StartupWaitFailed { process_id, error } => {
                error!(process_id, %error, "Gateway did not become reachable");
            }
            ReconcileEvent::ReadyLogs {
                process_id,
                stdout,
                stderr,
            } => {
                debug!(process_id, stdout, stderr, "Gateway startup output");
            }
            ReconcileEvent::StartupLogs { stdout, stderr } => {
                error!(stdout, stderr, "Gateway startup failed");
            }
            ReconcileEvent::LogsUnavailable { process_id, error } => {
                error!(process_id, %error, "Failed to get gateway logs");
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events.lock().clone()
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<ReconcileState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReconcileEvent::Transition { state } => Some(*state),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ReconcileEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_states() {
        let sink = RecordingSink::new();
        sink.emit(ReconcileEvent::transition(ReconcileState::NoTrackedProcess));
        sink.emit(ReconcileEvent::PortProbed {
            port: 18789,
            reachable: false,
        });
        sink.emit(ReconcileEvent::transition(ReconcileState::StartingNew));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(
            sink.states(),
            vec![ReconcileState::NoTrackedProcess, ReconcileState::StartingNew]
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = ReconcileEvent::waiting_for_port(18789, Duration::from_secs(3));
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"event\":\"waiting_for_port\""));
        assert!(json.contains("\"timeout_ms\":3000"));

        let json =
            serde_json::to_string(&ReconcileEvent::transition(ReconcileState::Ready)).unwrap();
        assert!(json.contains("\"state\":\"READY\""));
    }
}
