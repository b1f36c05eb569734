//! Finds the gateway among the processes a sandbox is tracking
//!
//! The gateway's CLI subcommands share a name prefix with the server
//! command, so a process only counts as the gateway when it matches a
//! gateway pattern and none of the CLI-utility patterns.

use crate::config::ProcessPatterns;
use crate::sandbox::{ProcessRef, Sandbox, SandboxError};

/// Classification of a process by its command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Long-running gateway server
    Gateway,
    /// Short-lived CLI invocation sharing the gateway's name
    CliUtility,
    /// Anything else
    Unrelated,
}

impl ProcessPatterns {
    pub fn classify(&self, command: &str) -> ProcessKind {
        if self.cli.iter().any(|p| command.contains(p.as_str())) {
            return ProcessKind::CliUtility;
        }
        if self.gateway.iter().any(|p| command.contains(p.as_str())) {
            return ProcessKind::Gateway;
        }
        ProcessKind::Unrelated
    }
}

/// Result of scanning the process list
pub enum Located {
    Found(ProcessRef),
    NotFound,
    /// Listing failed; callers treat this like `NotFound`
    EnumerationFailed(SandboxError),
}

impl Located {
    pub fn into_process(self) -> Option<ProcessRef> {
        match self {
            Located::Found(process) => Some(process),
            Located::NotFound | Located::EnumerationFailed(_) => None,
        }
    }
}

/// Scan the sandbox for a live gateway process
///
/// Returns the first process classified as `Gateway` whose status is
/// `Starting` or `Running`. Never propagates a listing failure.
pub async fn locate_gateway(sandbox: &dyn Sandbox, patterns: &ProcessPatterns) -> Located {
    let processes = match sandbox.list_processes().await {
        Ok(processes) => processes,
        Err(e) => return Located::EnumerationFailed(e),
    };

    processes
        .into_iter()
        .find(|p| patterns.classify(p.command()) == ProcessKind::Gateway && p.status().is_live())
        .map(Located::Found)
        .unwrap_or(Located::NotFound)
}

/// Convenience wrapper around [`locate_gateway`] that fails open
pub async fn find_gateway_process(
    sandbox: &dyn Sandbox,
    patterns: &ProcessPatterns,
) -> Option<ProcessRef> {
    locate_gateway(sandbox, patterns).await.into_process()
}
