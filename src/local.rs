//! A sandbox backed by host processes and loopback networking
//!
//! `LocalSandbox` tracks the processes it starts, captures their output and
//! reaches them over `127.0.0.1`. It is what the `sandgate` binary runs
//! against, and it makes the reconciler testable against real processes.

use crate::sandbox::{
    FetchRequest, FetchResponse, PortWaitMode, ProcessLogs, ProcessRef, ProcessStatus, Sandbox,
    SandboxError, SandboxProcess, StartOptions,
};
use async_trait::async_trait;
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval for polling a port in `wait_for_port` (in milliseconds)
const PORT_POLL_INTERVAL_MS: u64 = 100;

/// Captured output kept per stream; older output is dropped first
const MAX_LOG_BYTES: usize = 64 * 1024;

/// Exited processes kept after listing so their logs stay readable
pub const MAX_RETAINED_EXITED: usize = 4;

type FetchClient = Client<HttpConnector, Empty<Bytes>>;

fn build_fetch_client(connect_timeout: Duration) -> FetchClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);
    connector.set_connect_timeout(Some(connect_timeout));

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(1)
        .pool_idle_timeout(Duration::from_secs(30))
        .build(connector)
}

/// Send one request to `port` on loopback, keeping only the path of `request.url`
async fn loopback_fetch(
    client: &FetchClient,
    request: &FetchRequest,
    port: u16,
) -> Result<FetchResponse, SandboxError> {
    let uri: Uri = request
        .url
        .parse()
        .map_err(|e| SandboxError::Http(format!("invalid URL '{}': {}", request.url, e)))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let target = format!("http://127.0.0.1:{}{}", port, path);

    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| SandboxError::Http(e.to_string()))?;

    let req = Request::builder()
        .method(method)
        .uri(&target)
        .header("Host", format!("localhost:{}", port))
        .body(Empty::<Bytes>::new())
        .map_err(|e| SandboxError::Http(e.to_string()))?;

    let response = client
        .request(req)
        .await
        .map_err(|e| SandboxError::Http(e.to_string()))?;

    Ok(FetchResponse {
        status: response.status().as_u16(),
    })
}

/// Sandbox implementation over the local host
pub struct LocalSandbox {
    id: String,
    processes: DashMap<String, Arc<LocalProcess>>,
    next_seq: AtomicU64,
    client: FetchClient,
    grace_period: Duration,
}

impl LocalSandbox {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processes: DashMap::new(),
            next_seq: AtomicU64::new(0),
            client: build_fetch_client(Duration::from_secs(2)),
            grace_period: Duration::from_secs(5),
        }
    }

    /// Set the SIGTERM grace period used by `kill` (builder pattern)
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Forget all but the most recent `MAX_RETAINED_EXITED` dead processes
    ///
    /// `processes` must be sorted oldest first with fresh statuses.
    fn prune_exited(&self, processes: &[Arc<LocalProcess>]) {
        let dead: Vec<&Arc<LocalProcess>> =
            processes.iter().filter(|p| !p.status().is_live()).collect();
        let excess = dead.len().saturating_sub(MAX_RETAINED_EXITED);

        for process in &dead[..excess] {
            self.processes.remove(&process.id);
            debug!(sandbox = %self.id, process_id = %process.id, "Pruned exited process");
        }
    }

    /// Kill every live process this sandbox started
    pub async fn shutdown(&self) {
        let processes: Vec<Arc<LocalProcess>> =
            self.processes.iter().map(|e| Arc::clone(e.value())).collect();

        for process in processes {
            process.refresh_status().await;
            if process.status().is_live() {
                if let Err(e) = process.kill().await {
                    warn!(process_id = process.id(), error = %e, "Failed to stop process");
                }
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_processes(&self) -> Result<Vec<ProcessRef>, SandboxError> {
        let mut processes: Vec<Arc<LocalProcess>> =
            self.processes.iter().map(|e| Arc::clone(e.value())).collect();
        processes.sort_by_key(|p| p.seq);

        for process in &processes {
            process.refresh_status().await;
        }
        self.prune_exited(&processes);

        Ok(processes
            .into_iter()
            .filter(|p| self.processes.contains_key(&p.id))
            .map(|p| p as ProcessRef)
            .collect())
    }

    async fn start_process(
        &self,
        command: &str,
        options: StartOptions,
    ) -> Result<ProcessRef, SandboxError> {
        let argv = shell_words::split(command)
            .map_err(|e| SandboxError::Rejected(format!("cannot parse command '{}': {}", command, e)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Rejected("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(env) = options.env {
            for (key, value) in &env {
                cmd.env(key, value);
            }
        }

        let child = cmd.spawn()?;
        let id = Uuid::new_v4().to_string();
        let pid = child.id().unwrap_or(0);
        info!(sandbox = %self.id, process_id = %id, pid, command, "Process spawned");

        let process = Arc::new(LocalProcess::new(
            id.clone(),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
            command.to_string(),
            child,
            self.client.clone(),
            self.grace_period,
        ));
        self.processes.insert(id, Arc::clone(&process));

        Ok(process)
    }

    async fn container_fetch(
        &self,
        request: FetchRequest,
        port: u16,
    ) -> Result<FetchResponse, SandboxError> {
        loopback_fetch(&self.client, &request, port).await
    }
}

/// A host process started by [`LocalSandbox`]
pub struct LocalProcess {
    id: String,
    /// Start order within the sandbox
    seq: u64,
    command: String,
    child: tokio::sync::Mutex<Child>,
    status: Mutex<ProcessStatus>,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    client: FetchClient,
    grace_period: Duration,
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl LocalProcess {
    fn new(
        id: String,
        seq: u64,
        command: String,
        mut child: Child,
        client: FetchClient,
        grace_period: Duration,
    ) -> Self {
        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));

        if let Some(out) = child.stdout.take() {
            capture_output(out, Arc::clone(&stdout), id.clone(), "stdout");
        }
        if let Some(err) = child.stderr.take() {
            capture_output(err, Arc::clone(&stderr), id.clone(), "stderr");
        }

        Self {
            id,
            seq,
            command,
            child: tokio::sync::Mutex::new(child),
            status: Mutex::new(ProcessStatus::Starting),
            stdout,
            stderr,
            client,
            grace_period,
        }
    }

    /// Update the status from the OS if the process has exited
    pub async fn refresh_status(&self) {
        if !self.status.lock().is_live() {
            return;
        }

        let mut child = self.child.lock().await;
        let next = match child.try_wait() {
            Ok(None) => return,
            Ok(Some(exit)) if exit.success() => ProcessStatus::Exited,
            Ok(Some(_)) => ProcessStatus::Failed,
            Err(e) => {
                warn!(process_id = %self.id, error = %e, "Failed to query process status");
                ProcessStatus::Failed
            }
        };

        debug!(process_id = %self.id, status = %next, "Process is no longer running");
        *self.status.lock() = next;
    }

    async fn port_ready(&self, port: u16, mode: &PortWaitMode) -> bool {
        match mode {
            PortWaitMode::Tcp => TcpStream::connect(("127.0.0.1", port)).await.is_ok(),
            PortWaitMode::Http { path } => {
                let request = FetchRequest::get(format!("http://localhost:{}{}", port, path));
                loopback_fetch(&self.client, &request, port).await.is_ok()
            }
        }
    }
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    async fn wait_for_port(
        &self,
        port: u16,
        mode: PortWaitMode,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        let poll = async {
            loop {
                self.refresh_status().await;
                match self.status() {
                    ProcessStatus::Starting | ProcessStatus::Running => {}
                    status @ (ProcessStatus::Exited | ProcessStatus::Failed) => {
                        return Err(SandboxError::Rejected(format!(
                            "process {} is {} before port {} was ready",
                            self.id, status, port
                        )));
                    }
                }

                if self.port_ready(port, &mode).await {
                    *self.status.lock() = ProcessStatus::Running;
                    debug!(process_id = %self.id, port, "Port is ready");
                    return Ok(());
                }

                tokio::time::sleep(Duration::from_millis(PORT_POLL_INTERVAL_MS)).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(timeout)),
        }
    }

    async fn get_logs(&self) -> Result<ProcessLogs, SandboxError> {
        Ok(ProcessLogs {
            stdout: self.stdout.lock().clone(),
            stderr: self.stderr.lock().clone(),
        })
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        let mut child = self.child.lock().await;

        if child.try_wait()?.is_some() {
            *self.status.lock() = ProcessStatus::Exited;
            return Ok(());
        }

        if let Some(pid) = child.id() {
            info!(process_id = %self.id, pid, "Sending SIGTERM to process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(process_id = %self.id, ?status, "Process exited gracefully");
            }
            Ok(Err(e)) => {
                *self.status.lock() = ProcessStatus::Failed;
                return Err(SandboxError::Io(e));
            }
            Err(_) => {
                warn!(
                    process_id = %self.id,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                child.kill().await?;
            }
        }

        *self.status.lock() = ProcessStatus::Failed;
        Ok(())
    }
}

/// Append lines from `reader` to `buffer` until EOF
fn capture_output<R>(reader: R, buffer: Arc<Mutex<String>>, process_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        debug!(target: "gateway", process_id, stream, "{}", line);
                    }
                    let mut buf = buffer.lock();
                    buf.push_str(&line);
                    buf.push('\n');
                    if buf.len() > MAX_LOG_BYTES {
                        let mut cut = buf.len() - MAX_LOG_BYTES;
                        while !buf.is_char_boundary(cut) {
                            cut += 1;
                        }
                        buf.drain(..cut);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(process_id, stream, error = %e, "Stopped reading process output");
                    break;
                }
            }
        }
    });
}
