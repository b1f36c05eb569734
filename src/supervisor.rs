//! Periodic reconciliation used by the `sandgate` binary

use crate::reconciler::Reconciler;
use crate::sandbox::{Sandbox, SandboxProcess};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Re-run reconciliation every `interval` until shutdown is signalled
///
/// Shutdown also interrupts a reconciliation that is still in progress.
pub async fn supervise(
    reconciler: &Reconciler,
    sandbox: &dyn Sandbox,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }

        tokio::select! {
            result = reconciler.ensure_gateway(sandbox) => match result {
                Ok(gateway) => {
                    debug!(
                        process_id = gateway.process.id(),
                        origin = ?gateway.origin,
                        "Gateway healthy"
                    );
                }
                Err(e) => {
                    error!(error = %e, code = e.code().as_header_value(), "Gateway reconciliation failed");
                }
            },
            _ = shutdown_rx.changed() => {
                info!("Shutdown requested during reconciliation");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::sandbox::{FetchRequest, FetchResponse, ProcessRef, SandboxError, StartOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Listing never completes
    #[derive(Default)]
    struct Stuck {
        lists: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for Stuck {
        fn id(&self) -> &str {
            "stuck"
        }
        async fn list_processes(&self) -> Result<Vec<ProcessRef>, SandboxError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
        async fn start_process(
            &self,
            _command: &str,
            _options: StartOptions,
        ) -> Result<ProcessRef, SandboxError> {
            Err(SandboxError::Rejected("unused".to_string()))
        }
        async fn container_fetch(
            &self,
            _request: FetchRequest,
            _port: u16,
        ) -> Result<FetchResponse, SandboxError> {
            Err(SandboxError::Rejected("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconciliation() {
        let sandbox = Stuck::default();
        let reconciler = Reconciler::new(GatewayConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = supervise(
            &reconciler,
            &sandbox,
            Duration::from_millis(10),
            shutdown_rx,
        );
        let stop = async {
            while sandbox.lists.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            shutdown_tx.send(true).unwrap();
        };

        tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(run, stop) })
            .await
            .expect("supervisor kept running after shutdown");
        assert_eq!(sandbox.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let sandbox = Stuck::default();
        let reconciler = Reconciler::new(GatewayConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            supervise(&reconciler, &sandbox, Duration::from_secs(3600), shutdown_rx),
        )
        .await
        .expect("supervisor kept running after shutdown");
        assert_eq!(sandbox.lists.load(Ordering::SeqCst), 0);
    }
}
