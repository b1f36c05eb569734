//! Single-shot reachability probe for the gateway port
//!
//! Health is judged at the transport level: any completed HTTP response,
//! including 4xx and 5xx, means the port is open.

use crate::sandbox::{FetchRequest, Sandbox};
use std::time::Duration;
use tracing::debug;

/// Probe `port` inside the sandbox once. No retries.
pub async fn probe_port(sandbox: &dyn Sandbox, port: u16, timeout: Duration) -> bool {
    let request = FetchRequest::get(format!("http://localhost:{}/", port));

    match tokio::time::timeout(timeout, sandbox.container_fetch(request, port)).await {
        Ok(Ok(response)) => {
            debug!(port, status = response.status, "Probe got a response");
            true
        }
        Ok(Err(e)) => {
            debug!(port, error = %e, "Probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(port, "Probe failed (timeout)");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{FetchResponse, ProcessRef, SandboxError, StartOptions};
    use async_trait::async_trait;

    enum Behaviour {
        Status(u16),
        Refused,
        Hang,
    }

    struct FetchOnly(Behaviour);

    #[async_trait]
    impl Sandbox for FetchOnly {
        fn id(&self) -> &str {
            "probe-test"
        }

        async fn list_processes(&self) -> Result<Vec<ProcessRef>, SandboxError> {
            Ok(Vec::new())
        }

        async fn start_process(
            &self,
            _command: &str,
            _options: StartOptions,
        ) -> Result<ProcessRef, SandboxError> {
            Err(SandboxError::Rejected("not supported".to_string()))
        }

        async fn container_fetch(
            &self,
            request: FetchRequest,
            port: u16,
        ) -> Result<FetchResponse, SandboxError> {
            assert_eq!(request.url, format!("http://localhost:{}/", port));
            match self.0 {
                Behaviour::Status(status) => Ok(FetchResponse { status }),
                Behaviour::Refused => Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(FetchResponse { status: 200 })
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ok_response_is_reachable() {
        let sandbox = FetchOnly(Behaviour::Status(200));
        assert!(probe_port(&sandbox, 18789, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_error_status_is_reachable() {
        for status in [404, 500, 503] {
            let sandbox = FetchOnly(Behaviour::Status(status));
            assert!(probe_port(&sandbox, 18789, Duration::from_secs(1)).await);
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let sandbox = FetchOnly(Behaviour::Refused);
        assert!(!probe_port(&sandbox, 18789, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let sandbox = FetchOnly(Behaviour::Hang);
        assert!(!probe_port(&sandbox, 18789, Duration::from_millis(20)).await);
    }
}
