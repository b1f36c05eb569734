//! Gateway lifecycle reconciliation
//!
//! [`Reconciler::ensure_gateway`] converges a sandbox to exactly one healthy,
//! reachable gateway:
//!
//! 1. Run the storage precondition (fatal on failure)
//! 2. Look for a tracked gateway; wait for its port, or kill it if it never
//!    answers
//! 3. Probe the port directly, since the tracker can lose a gateway whose
//!    launcher script `exec`s into the server. A reachable port is adopted
//!    through a [`StandInProcess`] instead of launching a duplicate
//! 4. Launch a new gateway (under a launch lease when enabled)
//! 5. Wait for its port, probe once more if the wait fails, and otherwise
//!    fail with whatever logs could be captured
//!
//! No state is kept between calls apart from the lease table, so the
//! reconciler is safe to call once per incoming request.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{EventSink, ReconcileEvent, ReconcileState, TracingSink};
use crate::launcher::launch_gateway;
use crate::lease::{Acquired, LaunchLeases, LeaseGuard};
use crate::locator::{locate_gateway, Located};
use crate::probe::probe_port;
use crate::sandbox::{
    PortWaitMode, ProcessLogs, ProcessRef, ProcessStatus, Sandbox, SandboxError, SandboxProcess,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How the returned gateway came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOrigin {
    /// An already tracked gateway answered on its port
    Reused,
    /// The port answered but no tracked process backs it
    Untracked,
    /// A new gateway was launched and became reachable
    Launched,
    /// A new gateway's wait timed out but a follow-up probe succeeded
    LaunchedDespiteTimeout,
}

/// A gateway confirmed reachable on the configured port
#[derive(Debug, Clone)]
pub struct EnsuredGateway {
    pub process: ProcessRef,
    pub origin: GatewayOrigin,
}

impl EnsuredGateway {
    pub fn is_stand_in(&self) -> bool {
        self.origin == GatewayOrigin::Untracked
    }
}

/// Handle returned when the gateway is reachable but untracked
///
/// Its port wait resolves immediately because reachability was already
/// confirmed; it has no logs and cannot be killed.
#[derive(Debug, Clone)]
pub struct StandInProcess {
    port: u16,
}

impl StandInProcess {
    pub const ID: &'static str = "gateway-stand-in";

    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl SandboxProcess for StandInProcess {
    fn id(&self) -> &str {
        Self::ID
    }

    fn command(&self) -> &str {
        "echo gateway-already-running"
    }

    fn status(&self) -> ProcessStatus {
        ProcessStatus::Running
    }

    async fn wait_for_port(
        &self,
        _port: u16,
        _mode: PortWaitMode,
        _timeout: Duration,
    ) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn get_logs(&self) -> Result<ProcessLogs, SandboxError> {
        Ok(ProcessLogs::default())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Work that must succeed before any process logic runs
#[async_trait]
pub trait StoragePrecondition: Send + Sync {
    async fn prepare(&self, sandbox: &dyn Sandbox) -> Result<(), SandboxError>;
}

/// No storage to prepare
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStorage;

#[async_trait]
impl StoragePrecondition for NoStorage {
    async fn prepare(&self, _sandbox: &dyn Sandbox) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Creates the configured mount directory on the local filesystem
#[derive(Debug, Clone)]
pub struct MountDirectory {
    path: std::path::PathBuf,
}

impl MountDirectory {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StoragePrecondition for MountDirectory {
    async fn prepare(&self, _sandbox: &dyn Sandbox) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(&self.path).await?;
        tracing::debug!(path = %self.path.display(), "Storage directory ready");
        Ok(())
    }
}

/// Drives a sandbox to one healthy gateway
pub struct Reconciler {
    config: GatewayConfig,
    events: Arc<dyn EventSink>,
    storage: Arc<dyn StoragePrecondition>,
    leases: Option<Arc<LaunchLeases>>,
}

impl Reconciler {
    /// Create a reconciler with tracing events, no storage precondition and
    /// a private lease table (if the config enables leasing)
    pub fn new(config: GatewayConfig) -> Self {
        let leases = config.launch_lease_ttl().map(|_| LaunchLeases::new());
        Self {
            config,
            events: Arc::new(TracingSink),
            storage: Arc::new(NoStorage),
            leases,
        }
    }

    /// Set the event sink (builder pattern)
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the storage precondition (builder pattern)
    pub fn with_storage(mut self, storage: Arc<dyn StoragePrecondition>) -> Self {
        self.storage = storage;
        self
    }

    /// Share a lease table between reconcilers (builder pattern)
    pub fn with_leases(mut self, leases: Arc<LaunchLeases>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn emit(&self, event: ReconcileEvent) {
        self.events.emit(event);
    }

    fn enter(&self, state: ReconcileState) {
        self.emit(ReconcileEvent::transition(state));
    }

    /// Ensure one healthy gateway is reachable in `sandbox`
    pub async fn ensure_gateway(
        &self,
        sandbox: &dyn Sandbox,
    ) -> Result<EnsuredGateway, GatewayError> {
        let env = self.config.build_env_vars()?;
        self.ensure_gateway_with_env(sandbox, env).await
    }

    /// Like [`ensure_gateway`](Self::ensure_gateway) with a prebuilt environment
    pub async fn ensure_gateway_with_env(
        &self,
        sandbox: &dyn Sandbox,
        env: HashMap<String, String>,
    ) -> Result<EnsuredGateway, GatewayError> {
        if let Err(e) = self.storage.prepare(sandbox).await {
            self.enter(ReconcileState::Failed);
            return Err(GatewayError::Storage(e));
        }

        if let Some(ready) = self.reuse_or_adopt(sandbox, false).await {
            return Ok(ready);
        }

        self.enter(ReconcileState::StartingNew);
        let _lease = match self.take_launch_lease(sandbox).await {
            LeaseDecision::Proceed(guard) => guard,
            LeaseDecision::AlreadyUp(ready) => return Ok(ready),
        };

        let process = match launch_gateway(sandbox, &self.config.command, env.clone()).await {
            Ok(process) => process,
            Err(e) => {
                if let GatewayError::LaunchFailed { ref command, ref source } = e {
                    self.emit(ReconcileEvent::LaunchFailed {
                        command: command.clone(),
                        error: source.to_string(),
                    });
                }
                self.enter(ReconcileState::Failed);
                return Err(e);
            }
        };

        let mut env_keys: Vec<String> = env.into_keys().collect();
        env_keys.sort();
        self.emit(ReconcileEvent::Launched {
            process_id: process.id().to_string(),
            command: self.config.command.clone(),
            env_keys,
        });

        self.await_new_gateway(sandbox, process).await
    }

    /// Steps 2 and 3: reuse a tracked gateway or adopt an untracked one
    ///
    /// With `skip_abandoned`, a tracked process that a lease holder already
    /// waited on in vain is killed without waiting for it again.
    async fn reuse_or_adopt(
        &self,
        sandbox: &dyn Sandbox,
        skip_abandoned: bool,
    ) -> Option<EnsuredGateway> {
        let port = self.config.port;
        let timeout = self.config.startup_timeout();

        match locate_gateway(sandbox, &self.config.patterns).await {
            Located::Found(process) => {
                self.emit(ReconcileEvent::TrackedProcessFound {
                    process_id: process.id().to_string(),
                    status: process.status(),
                });

                let abandoned = skip_abandoned
                    && self
                        .leases
                        .as_ref()
                        .is_some_and(|leases| leases.is_abandoned(sandbox.id(), process.id()));

                let reachable = if abandoned {
                    self.emit(ReconcileEvent::AbandonedLaunchFound {
                        process_id: process.id().to_string(),
                    });
                    false
                } else {
                    self.emit(ReconcileEvent::waiting_for_port(port, timeout));
                    process
                        .wait_for_port(port, PortWaitMode::Tcp, timeout)
                        .await
                        .is_ok()
                };

                if reachable {
                    self.enter(ReconcileState::TrackedHealthy);
                    self.enter(ReconcileState::Ready);
                    return Some(EnsuredGateway {
                        process,
                        origin: GatewayOrigin::Reused,
                    });
                }

                self.enter(ReconcileState::TrackedUnhealthy);
                if let Err(e) = process.kill().await {
                    self.emit(ReconcileEvent::KillFailed {
                        process_id: process.id().to_string(),
                        error: e.to_string(),
                    });
                }
            }
            Located::EnumerationFailed(e) => {
                self.emit(ReconcileEvent::EnumerationFailed {
                    error: e.to_string(),
                });
                self.enter(ReconcileState::NoTrackedProcess);
            }
            Located::NotFound => {
                self.enter(ReconcileState::NoTrackedProcess);
            }
        }

        if self.probe(sandbox).await {
            self.enter(ReconcileState::UntrackedHealthy);
            self.enter(ReconcileState::Ready);
            return Some(self.stand_in());
        }
        None
    }

    async fn take_launch_lease(&self, sandbox: &dyn Sandbox) -> LeaseDecision {
        let (Some(leases), Some(ttl)) = (self.leases.as_ref(), self.config.launch_lease_ttl())
        else {
            return LeaseDecision::Proceed(None);
        };

        if leases.is_held(sandbox.id()) {
            self.emit(ReconcileEvent::LeaseContended {
                sandbox_id: sandbox.id().to_string(),
            });
        }

        let Acquired { guard, contended } = leases.acquire(sandbox.id(), ttl).await;
        if !contended {
            return LeaseDecision::Proceed(Some(guard));
        }

        // Whoever held the lease may have brought the gateway up meanwhile
        if let Some(ready) = self.reuse_or_adopt(sandbox, true).await {
            return LeaseDecision::AlreadyUp(ready);
        }
        self.enter(ReconcileState::StartingNew);

        LeaseDecision::Proceed(Some(guard))
    }

    /// Step 5: wait for a freshly launched gateway
    async fn await_new_gateway(
        &self,
        sandbox: &dyn Sandbox,
        process: ProcessRef,
    ) -> Result<EnsuredGateway, GatewayError> {
        let port = self.config.port;
        let timeout = self.config.startup_timeout();
        self.emit(ReconcileEvent::waiting_for_port(port, timeout));

        let wait_error = match process.wait_for_port(port, PortWaitMode::Tcp, timeout).await {
            Ok(()) => {
                return Ok(self
                    .launched_ready(sandbox, process, GatewayOrigin::Launched)
                    .await)
            }
            Err(e) => e,
        };

        self.emit(ReconcileEvent::StartupWaitFailed {
            process_id: process.id().to_string(),
            error: wait_error.to_string(),
        });

        // The gateway may have come up between the timeout and now
        if self.probe(sandbox).await {
            return Ok(self
                .launched_ready(sandbox, process, GatewayOrigin::LaunchedDespiteTimeout)
                .await);
        }

        if let Some(leases) = self.leases.as_ref() {
            leases.mark_abandoned(sandbox.id(), process.id());
        }
        self.enter(ReconcileState::Failed);
        match process.get_logs().await {
            Ok(logs) => {
                self.emit(ReconcileEvent::StartupLogs {
                    stdout: logs.stdout.clone(),
                    stderr: logs.stderr.clone(),
                });
                Err(GatewayError::StartupFailed {
                    stdout: logs.stdout,
                    stderr: logs.stderr,
                    source: wait_error,
                })
            }
            Err(e) => {
                self.emit(ReconcileEvent::LogsUnavailable {
                    process_id: process.id().to_string(),
                    error: e.to_string(),
                });
                Err(GatewayError::StartupTimeout {
                    port,
                    timeout,
                    source: wait_error,
                })
            }
        }
    }

    async fn launched_ready(
        &self,
        sandbox: &dyn Sandbox,
        process: ProcessRef,
        origin: GatewayOrigin,
    ) -> EnsuredGateway {
        if let Some(leases) = self.leases.as_ref() {
            leases.clear_abandoned(sandbox.id());
        }

        match process.get_logs().await {
            Ok(logs) => self.emit(ReconcileEvent::ReadyLogs {
                process_id: process.id().to_string(),
                stdout: logs.stdout,
                stderr: logs.stderr,
            }),
            Err(e) => {
                tracing::debug!(process_id = process.id(), error = %e, "No logs from new gateway");
            }
        }

        self.enter(ReconcileState::Ready);
        EnsuredGateway { process, origin }
    }

    async fn probe(&self, sandbox: &dyn Sandbox) -> bool {
        let port = self.config.port;
        let reachable = probe_port(sandbox, port, self.config.probe_timeout()).await;
        self.emit(ReconcileEvent::PortProbed { port, reachable });
        reachable
    }

    fn stand_in(&self) -> EnsuredGateway {
        EnsuredGateway {
            process: Arc::new(StandInProcess::new(self.config.port)),
            origin: GatewayOrigin::Untracked,
        }
    }
}

enum LeaseDecision {
    Proceed(Option<LeaseGuard>),
    AlreadyUp(EnsuredGateway),
}

/// Ensure the gateway with default collaborators
///
/// Concurrent calls share the process-wide [`LaunchLeases::global`] table.
pub async fn ensure_gateway(
    sandbox: &dyn Sandbox,
    config: &GatewayConfig,
) -> Result<EnsuredGateway, GatewayError> {
    Reconciler::new(config.clone())
        .with_leases(LaunchLeases::global())
        .ensure_gateway(sandbox)
        .await
}
