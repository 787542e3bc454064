use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FixtureError, Result};

/// Environment variable naming a TOML file to load before env overrides
pub const CONFIG_ENV: &str = "SERVER_FIXTURES_CONFIG";

/// Fixture-wide settings shared by every instance
#[derive(Debug, Deserialize, Clone)]
pub struct FixtureConfig {
    /// Path to the httpd executable
    #[serde(default = "default_httpd_executable")]
    pub httpd_executable: PathBuf,

    /// Directory containing httpd's loadable modules
    #[serde(default = "default_httpd_modules")]
    pub httpd_modules: PathBuf,

    /// Extra flags passed to httpd after `-f <config>`
    #[serde(default = "default_httpd_extra_args")]
    pub httpd_extra_args: Vec<String>,

    /// Externally reachable hostname for all instances (resolved when unset)
    pub hostname: Option<String>,

    /// Parent directory for instance workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,

    /// Leave workspaces on disk after teardown for inspection
    #[serde(default)]
    pub keep_workspace: bool,

    /// Set DEBUG=1 in spawned server processes
    #[serde(default)]
    pub debug: bool,

    /// Maximum time to wait for an instance to become ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// First delay between readiness probes in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Upper bound the probe delay backs off to in milliseconds
    #[serde(default = "default_ready_max_poll_interval")]
    pub ready_max_poll_interval_ms: u64,

    /// Path probed for readiness
    #[serde(default = "default_ready_path")]
    pub ready_path: String,

    /// Grace period between SIGTERM and SIGKILL on teardown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Attempts per client call before surfacing an error
    #[serde(default = "default_client_attempts")]
    pub client_attempts: u32,

    /// Base delay between client retries in milliseconds
    #[serde(default = "default_client_retry_delay")]
    pub client_retry_delay_ms: u64,

    /// Timeout for a single client request
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Bind probes per port allocation
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            httpd_executable: default_httpd_executable(),
            httpd_modules: default_httpd_modules(),
            httpd_extra_args: default_httpd_extra_args(),
            hostname: None,
            workspace_root: None,
            keep_workspace: false,
            debug: false,
            startup_timeout_secs: default_startup_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_max_poll_interval_ms: default_ready_max_poll_interval(),
            ready_path: default_ready_path(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            client_attempts: default_client_attempts(),
            client_retry_delay_ms: default_client_retry_delay(),
            client_timeout_secs: default_client_timeout(),
            port_attempts: default_port_attempts(),
        }
    }
}

// Default value functions
fn default_httpd_executable() -> PathBuf {
    PathBuf::from("/usr/sbin/apache2")
}

fn default_httpd_modules() -> PathBuf {
    PathBuf::from("/usr/lib/apache2/modules")
}

fn default_httpd_extra_args() -> Vec<String> {
    vec!["-DFOREGROUND".to_string()] // keep httpd attached so it can be supervised
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_ready_poll_interval() -> u64 {
    100 // 100ms
}

fn default_ready_max_poll_interval() -> u64 {
    1000 // 1 second
}

fn default_ready_path() -> String {
    "/".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

fn default_client_attempts() -> u32 {
    3
}

fn default_client_retry_delay() -> u64 {
    250 // 250ms, doubled per retry
}

fn default_client_timeout() -> u64 {
    10
}

fn default_port_attempts() -> u32 {
    100
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl FixtureConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FixtureError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: FixtureConfig = toml::from_str(&content)
            .map_err(|e| FixtureError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults (or the file named by `SERVER_FIXTURES_CONFIG`) with environment overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(v) = lookup("SERVER_FIXTURES_HTTPD") {
            config.httpd_executable = PathBuf::from(v);
        }
        if let Some(v) = lookup("SERVER_FIXTURES_HTTPD_MODULES") {
            config.httpd_modules = PathBuf::from(v);
        }
        if let Some(v) = lookup("SERVER_FIXTURES_HTTPD_ARGS") {
            config.httpd_extra_args = shell_words::split(&v).map_err(|e| {
                FixtureError::Config(format!("SERVER_FIXTURES_HTTPD_ARGS: {}", e))
            })?;
        }
        if let Some(v) = lookup("SERVER_FIXTURES_HOSTNAME") {
            config.hostname = Some(v);
        }
        if let Some(v) = lookup("SERVER_FIXTURES_WORKSPACE_ROOT") {
            config.workspace_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SERVER_FIXTURES_KEEP_WORKSPACE") {
            config.keep_workspace = parse_bool(&v);
        }
        if let Some(v) = lookup("SERVER_FIXTURES_DEBUG") {
            config.debug = parse_bool(&v);
        }
        if let Some(v) = lookup("SERVER_FIXTURES_STARTUP_TIMEOUT") {
            config.startup_timeout_secs = v.trim().parse().map_err(|e| {
                FixtureError::Config(format!("SERVER_FIXTURES_STARTUP_TIMEOUT '{}': {}", v, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.startup_timeout_secs == 0 {
            errors.push("'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.ready_poll_interval_ms == 0 {
            errors.push("'ready_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.ready_max_poll_interval_ms < self.ready_poll_interval_ms {
            errors.push("'ready_max_poll_interval_ms' must be >= 'ready_poll_interval_ms'".to_string());
        }
        if !self.ready_path.starts_with('/') {
            errors.push(format!("'ready_path' must start with '/', got '{}'", self.ready_path));
        }
        if self.client_attempts == 0 {
            errors.push("'client_attempts' must be greater than 0".to_string());
        }
        if self.client_timeout_secs == 0 {
            errors.push("'client_timeout_secs' must be greater than 0".to_string());
        }
        if self.port_attempts == 0 {
            errors.push("'port_attempts' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(FixtureError::Config(errors.join("; ")));
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_max_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn client_retry_delay(&self) -> Duration {
        Duration::from_millis(self.client_retry_delay_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
