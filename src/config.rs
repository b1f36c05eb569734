use crate::error::GatewayError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Gateway lifecycle settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Settings for the `sandgate` binary
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Configuration consumed by each reconciliation call
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Port the gateway listens on inside the sandbox
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Command used to launch the gateway
    #[serde(default = "default_launch_command")]
    pub command: String,

    /// How long to wait for the gateway port after (re)starting it
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Timeout for a single reachability probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// TTL of the in-process launch lease (0 disables the lease)
    #[serde(default = "default_launch_lease_ttl")]
    pub launch_lease_ttl_secs: u64,

    /// Command-line patterns used to recognise the gateway
    #[serde(default)]
    pub patterns: ProcessPatterns,

    /// Static environment variables passed to the gateway
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Worker-level settings forwarded into the gateway environment
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Persistent storage mounted before the gateway starts
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Command-line substrings used to classify sandbox processes
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProcessPatterns {
    /// Substrings identifying a gateway server invocation
    #[serde(default = "default_gateway_patterns")]
    pub gateway: Vec<String>,

    /// Substrings identifying short-lived CLI invocations that share the gateway's name
    #[serde(default = "default_cli_patterns")]
    pub cli: Vec<String>,
}

impl Default for ProcessPatterns {
    fn default() -> Self {
        Self {
            gateway: default_gateway_patterns(),
            cli: default_cli_patterns(),
        }
    }
}

/// Worker-level settings that become gateway environment variables
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkerSettings {
    /// Host environment variables copied into the gateway when set
    #[serde(default)]
    pub passthrough: Vec<String>,

    /// Variables that must end up in the gateway environment
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory to prepare before launching (exported as STORAGE_MOUNT_PATH)
    pub mount_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Interval between reconciliations run by the binary
    #[serde(default = "default_supervise_interval")]
    pub supervise_interval_secs: u64,

    /// Identifier of the local sandbox
    #[serde(default = "default_sandbox_id")]
    pub sandbox_id: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            supervise_interval_secs: default_supervise_interval(),
            sandbox_id: default_sandbox_id(),
        }
    }
}

impl SupervisorConfig {
    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            command: default_launch_command(),
            startup_timeout_ms: default_startup_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            launch_lease_ttl_secs: default_launch_lease_ttl(),
            patterns: ProcessPatterns::default(),
            env: HashMap::new(),
            worker: WorkerSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a config for a gateway launched by `command` on `port`
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            port,
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set the startup timeout (builder pattern)
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set static environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Lease TTL, or `None` when launch leasing is disabled
    pub fn launch_lease_ttl(&self) -> Option<Duration> {
        match self.launch_lease_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Validate the gateway configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("gateway: 'port' must be greater than 0".to_string());
        }
        if self.command.trim().is_empty() {
            return Err("gateway: 'command' must not be empty".to_string());
        }
        if self.startup_timeout_ms == 0 {
            return Err("gateway: 'startup_timeout_ms' must be greater than 0".to_string());
        }
        // A lease that expires mid-wait lets a second caller launch a duplicate
        if self.launch_lease_ttl_secs != 0
            && self.launch_lease_ttl_secs.saturating_mul(1000) <= self.startup_timeout_ms
        {
            return Err(format!(
                "gateway: 'launch_lease_ttl_secs' ({}s) must exceed 'startup_timeout_ms' ({}ms)",
                self.launch_lease_ttl_secs, self.startup_timeout_ms
            ));
        }
        if self.patterns.gateway.is_empty() {
            return Err("gateway: at least one gateway pattern is required".to_string());
        }
        Ok(())
    }

    /// Build the environment passed to the gateway process
    ///
    /// Static `env` entries win over passthrough variables. Fails with
    /// `ConfigMissing` when a `required` variable ends up absent.
    pub fn build_env_vars(&self) -> Result<HashMap<String, String>, GatewayError> {
        self.build_env_vars_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn build_env_vars_from<F>(
        &self,
        lookup: F,
    ) -> Result<HashMap<String, String>, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars = HashMap::new();

        for key in &self.worker.passthrough {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                vars.insert(key.clone(), value);
            }
        }

        if let Some(ref mount_path) = self.storage.mount_path {
            vars.insert("STORAGE_MOUNT_PATH".to_string(), mount_path.clone());
        }

        for (key, value) in &self.env {
            vars.insert(key.clone(), value.clone());
        }

        let missing: Vec<&str> = self
            .worker
            .required
            .iter()
            .filter(|key| !vars.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(GatewayError::ConfigMissing(missing.join(", ")));
        }

        Ok(vars)
    }
}

// Default value functions
fn default_gateway_port() -> u16 {
    18789
}

fn default_launch_command() -> String {
    "/usr/local/bin/start-openclaw.sh".to_string()
}

fn default_startup_timeout() -> u64 {
    180_000
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_launch_lease_ttl() -> u64 {
    240
}

fn default_gateway_patterns() -> Vec<String> {
    [
        "start-openclaw.sh",
        "openclaw gateway",
        "start-moltbot.sh",
        "clawdbot gateway",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cli_patterns() -> Vec<String> {
    [
        "openclaw devices",
        "openclaw --version",
        "openclaw onboard",
        "clawdbot devices",
        "clawdbot --version",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_supervise_interval() -> u64 {
    30
}

fn default_sandbox_id() -> String {
    "local".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.gateway.validate() {
            errors.push(e);
        }
        if self.supervisor.supervise_interval_secs == 0 {
            errors.push("supervisor: 'supervise_interval_secs' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}
