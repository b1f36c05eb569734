//! LocalSandbox against real processes and loopback sockets
#![cfg(unix)]

use sandgate::config::GatewayConfig;
use sandgate::local::{LocalSandbox, MAX_RETAINED_EXITED};
use sandgate::reconciler::{GatewayOrigin, Reconciler};
use sandgate::sandbox::{
    FetchRequest, PortWaitMode, ProcessStatus, Sandbox, SandboxError, SandboxProcess,
    StartOptions,
};
use sandgate::GatewayError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Answer every request with an empty 404
fn serve_not_found(listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });
}

fn sandbox() -> LocalSandbox {
    LocalSandbox::new("local-test").with_grace_period(Duration::from_secs(2))
}

fn gateway_config(port: u16, command: &str) -> GatewayConfig {
    let mut config =
        GatewayConfig::new(command, port).with_startup_timeout(Duration::from_secs(1));
    config.probe_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_output_is_captured() {
    let sandbox = sandbox();
    let process = sandbox
        .start_process(
            "sh -c 'echo hello; echo oops >&2; exec sleep 60'",
            StartOptions::default(),
        )
        .await
        .unwrap();

    let mut logs = process.get_logs().await.unwrap();
    for _ in 0..40 {
        if logs.stdout.contains("hello") && logs.stderr.contains("oops") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        logs = process.get_logs().await.unwrap();
    }
    assert_eq!(logs.stdout, "hello\n");
    assert_eq!(logs.stderr, "oops\n");

    process.kill().await.unwrap();
    assert!(!process.status().is_live());
}

#[tokio::test]
async fn test_env_reaches_process() {
    let sandbox = sandbox();
    let mut env = HashMap::new();
    env.insert("GATEWAY_TOKEN".to_string(), "secret-token".to_string());

    let process = sandbox
        .start_process(
            "sh -c 'echo token=$GATEWAY_TOKEN'",
            StartOptions { env: Some(env) },
        )
        .await
        .unwrap();

    let mut stdout = String::new();
    for _ in 0..40 {
        stdout = process.get_logs().await.unwrap().stdout;
        if !stdout.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stdout, "token=secret-token\n");
}

#[tokio::test]
async fn test_exited_process_is_reported() {
    let sandbox = sandbox();
    let process = sandbox
        .start_process("sh -c 'exit 3'", StartOptions::default())
        .await
        .unwrap();

    let port = free_port().await;
    let err = process
        .wait_for_port(port, PortWaitMode::Tcp, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Rejected(_)));
    assert_eq!(process.status(), ProcessStatus::Failed);

    let listed = sandbox.list_processes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status(), ProcessStatus::Failed);
}

#[tokio::test]
async fn test_wait_for_port_times_out() {
    let sandbox = sandbox();
    let process = sandbox
        .start_process("sleep 60", StartOptions::default())
        .await
        .unwrap();

    let port = free_port().await;
    let err = process
        .wait_for_port(port, PortWaitMode::Tcp, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
    assert!(process.status().is_live());

    sandbox.shutdown().await;
    assert!(!process.status().is_live());
}

#[tokio::test]
async fn test_wait_for_port_tcp_and_http() {
    let sandbox = sandbox();
    let process = sandbox
        .start_process("sleep 60", StartOptions::default())
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_not_found(listener);

    process
        .wait_for_port(port, PortWaitMode::Tcp, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(process.status(), ProcessStatus::Running);

    process
        .wait_for_port(
            port,
            PortWaitMode::Http {
                path: "/health".to_string(),
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let response = sandbox
        .container_fetch(FetchRequest::get("http://localhost/anything"), port)
        .await
        .unwrap();
    assert_eq!(response.status, 404);

    sandbox.shutdown().await;
}

#[tokio::test]
async fn test_tracked_gateway_is_reused() {
    let sandbox = sandbox();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_not_found(listener);

    let existing = sandbox
        .start_process("sh -c 'exec sleep 60' openclaw gateway", StartOptions::default())
        .await
        .unwrap();

    let config = gateway_config(port, "sh -c 'exec sleep 60' start-openclaw.sh");
    let gateway = Reconciler::new(config).ensure_gateway(&sandbox).await.unwrap();

    assert_eq!(gateway.origin, GatewayOrigin::Reused);
    assert_eq!(gateway.process.id(), existing.id());
    assert_eq!(sandbox.list_processes().await.unwrap().len(), 1);

    sandbox.shutdown().await;
}

#[tokio::test]
async fn test_untracked_listener_is_adopted() {
    let sandbox = sandbox();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_not_found(listener);

    let config = gateway_config(port, "sh -c 'exec sleep 60' start-openclaw.sh");
    let gateway = Reconciler::new(config).ensure_gateway(&sandbox).await.unwrap();

    assert!(gateway.is_stand_in());
    assert!(sandbox.list_processes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_gateway_that_never_listens_fails_with_logs() {
    let sandbox = sandbox();
    let port = free_port().await;
    let command = "sh -c 'echo booting; echo \"bind failed\" >&2; exec sleep 60' start-openclaw.sh";

    let err = Reconciler::new(gateway_config(port, command))
        .ensure_gateway(&sandbox)
        .await
        .unwrap_err();

    match err {
        GatewayError::StartupFailed { stdout, stderr, .. } => {
            assert!(stdout.contains("booting"));
            assert!(stderr.contains("bind failed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The launched process was left running for the next attempt to find
    let listed = sandbox.list_processes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].status().is_live());

    sandbox.shutdown().await;
}

#[tokio::test]
async fn test_relaunches_do_not_accumulate() {
    let sandbox = sandbox();
    let mut killed = Vec::new();
    for _ in 0..MAX_RETAINED_EXITED + 2 {
        let process = sandbox
            .start_process("sleep 60", StartOptions::default())
            .await
            .unwrap();
        process.kill().await.unwrap();
        killed.push(process.id().to_string());
    }
    let live = sandbox
        .start_process("sleep 60", StartOptions::default())
        .await
        .unwrap();

    let listed = sandbox.list_processes().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|p| p.id()).collect();

    assert_eq!(listed.len(), MAX_RETAINED_EXITED + 1);
    assert_eq!(ids.last(), Some(&live.id()));
    // Oldest dead processes go first
    assert!(!ids.contains(&killed[0].as_str()));
    assert!(!ids.contains(&killed[1].as_str()));
    assert!(ids.contains(&killed[killed.len() - 1].as_str()));

    // Pruning is stable across listings
    assert_eq!(sandbox.list_processes().await.unwrap().len(), MAX_RETAINED_EXITED + 1);

    sandbox.shutdown().await;
}
