//! Starts a new gateway process inside the sandbox

use crate::error::GatewayError;
use crate::sandbox::{ProcessRef, Sandbox, StartOptions};
use std::collections::HashMap;
use tracing::debug;

/// Start the gateway with `command` and `env`
///
/// An empty environment is passed as "no override". Failures of the
/// sandbox's start primitive are returned as `LaunchFailed` and not retried.
pub async fn launch_gateway(
    sandbox: &dyn Sandbox,
    command: &str,
    env: HashMap<String, String>,
) -> Result<ProcessRef, GatewayError> {
    let mut env_keys: Vec<&String> = env.keys().collect();
    env_keys.sort();
    debug!(command, ?env_keys, "Starting gateway process");

    let options = StartOptions {
        env: if env.is_empty() { None } else { Some(env) },
    };

    match sandbox.start_process(command, options).await {
        Ok(process) => {
            debug!(
                process_id = process.id(),
                status = %process.status(),
                "Sandbox accepted gateway process"
            );
            Ok(process)
        }
        Err(e) => {
            debug!(command, error = %e, "Sandbox refused gateway process");
            Err(GatewayError::LaunchFailed {
                command: command.to_string(),
                source: e,
            })
        }
    }
}
