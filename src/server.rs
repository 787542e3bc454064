//! Generic lifecycle of one ephemeral server instance
//!
//! A [`TestServer`] owns everything acquired for one instance: its workspace,
//! port lease and supervised process. Product-specific behaviour (config
//! syntax, argv, dependency checks) is supplied through [`ServerProduct`].
//!
//! Startup order is dependency check, workspace, port, config render, spawn,
//! readiness. A failure at any step releases exactly what had been acquired up
//! to that point. [`TestServer::teardown`] is idempotent and never fails; if an
//! instance is dropped without it, `Drop` kills the process and removes the
//! workspace synchronously.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ServerClient;
use crate::config::FixtureConfig;
use crate::error::{FixtureError, Result};
use crate::hostname;
use crate::port::{PortAllocator, PortLease};
use crate::process::{LaunchSpec, ProcessState, ServerProcess};
use crate::readiness::ReadinessProbe;
use crate::workspace::Workspace;

/// Values available to a product while it prepares an instance
#[derive(Debug, Clone, Copy)]
pub struct InstanceContext<'a> {
    pub id: Uuid,
    pub hostname: &'a str,
    pub port: u16,
    pub workspace: &'a Workspace,
    pub config: &'a FixtureConfig,
}

impl InstanceContext<'_> {
    /// `host:port` the server should listen on
    pub fn listen_addr(&self) -> String {
        hostname::authority(self.hostname, self.port)
    }
}

/// What a specific server product contributes to the generic lifecycle
pub trait ServerProduct: Send + Sync {
    /// Short name used for logging and the workspace prefix
    fn name(&self) -> &str;

    /// Starting point for port probing
    fn port_seed(&self) -> u16;

    /// File name of the rendered config inside the workspace
    fn config_file_name(&self) -> &str {
        "server.conf"
    }

    /// Per-instance hostname override
    fn hostname(&self) -> Option<&str> {
        None
    }

    /// Fail with [`FixtureError::MissingDependency`] if anything needed to run is absent
    fn check_dependencies(&self, _config: &FixtureConfig) -> Result<()> {
        Ok(())
    }

    /// Create any extra directories or files the server expects
    fn prepare_workspace(&self, _ctx: &InstanceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn render_config(&self, ctx: &InstanceContext<'_>) -> Result<String>;

    /// Full argv, program first
    fn command(&self, config_path: &Path, config: &FixtureConfig) -> Vec<OsString>;

    /// Extra environment for the child
    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn readiness(&self, config: &FixtureConfig) -> ReadinessProbe {
        ReadinessProbe::from_config(config)
    }
}

/// A provisioned, running instance of a server product
#[derive(Debug)]
pub struct TestServer<P: ServerProduct> {
    id: Uuid,
    product: P,
    hostname: String,
    port: u16,
    uri: String,
    config_path: PathBuf,
    process: ServerProcess,
    workspace: Workspace,
    lease: Option<PortLease>,
    client: ServerClient,
    grace_period: Duration,
    torn_down: bool,
}

impl<P: ServerProduct> TestServer<P> {
    /// Provision and start an instance, returning once it is ready
    pub async fn start(product: P, config: &FixtureConfig) -> Result<Self> {
        let id = Uuid::new_v4();

        // Before anything is acquired, so a missing binary leaks nothing
        product.check_dependencies(config)?;

        let hostname = hostname::choose(product.hostname(), config.hostname.as_deref());
        let workspace = Workspace::create(config.workspace_root.as_deref(), &format!("{}-", product.name()))?
            .keep_on_destroy(config.keep_workspace);
        let lease = PortAllocator::global().allocate_with(product.port_seed(), config.port_attempts)?;
        let port = lease.port();

        info!(
            instance = %id,
            server = product.name(),
            %hostname,
            port,
            workspace = %workspace.path().display(),
            "Provisioned instance"
        );

        let ctx = InstanceContext {
            id,
            hostname: &hostname,
            port,
            workspace: &workspace,
            config,
        };
        product.prepare_workspace(&ctx)?;
        let rendered = product.render_config(&ctx)?;
        let config_path = workspace.write_file(product.config_file_name(), &rendered)?;
        debug!(instance = %id, config = %config_path.display(), "Config written");

        let mut spec = LaunchSpec::from_argv(product.command(&config_path, config))
            .ok_or_else(|| FixtureError::Config(format!("{}: empty command", product.name())))?
            .with_cwd(workspace.path())
            .with_log_dir(workspace.logs_dir())
            .with_debug(config.debug);
        for (key, value) in product.env() {
            spec = spec.with_env(key, value);
        }

        let mut process = ServerProcess::spawn(&spec)?;

        let probe = product.readiness(config);
        let ready = probe
            .wait_until_ready(&hostname, port, || process.check_alive())
            .await;
        if let Err(e) = ready {
            warn!(instance = %id, port, error = %e, "Instance failed to start");
            process.stop(config.shutdown_grace_period()).await;
            return Err(e);
        }
        process.mark_running();

        let uri = hostname::http_uri(&hostname, port);
        let client = ServerClient::from_config(uri.clone(), config)?;

        info!(instance = %id, server = product.name(), port, pid = process.pid(), "Instance ready");

        Ok(Self {
            id,
            product,
            hostname,
            port,
            uri,
            config_path,
            process,
            workspace,
            lease: Some(lease),
            client,
            grace_period: config.shutdown_grace_period(),
            torn_down: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn product(&self) -> &P {
        &self.product
    }

    /// `http://host:port` of the instance root, the same base the client uses
    pub fn uri(&self) -> String {
        self.uri.clone()
    }

    /// Absolute URL of `path` under the instance root
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.uri(), path.trim_start_matches('/'))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.process.state()
    }

    pub fn client(&self) -> &ServerClient {
        &self.client
    }

    /// GET `path` relative to the root, decoded as JSON, with retries
    pub async fn query(&self, path: &str, params: &[(&str, &str)]) -> Result<serde_json::Value> {
        self.client.query(path, params).await
    }

    pub async fn query_as<T: DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> Result<T> {
        self.client.query_as(path, params).await
    }

    /// POST `payload` as JSON relative to the root, decoded as JSON, with retries
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, payload: &B) -> Result<serde_json::Value> {
        self.client.post(path, payload).await
    }

    /// Fail if the process has died since startup
    pub fn check_alive(&mut self) -> Result<()> {
        self.process.check_alive()
    }

    /// Stop the process, then remove the workspace, then release the port. Idempotent.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            debug!(instance = %self.id, "Teardown already done");
            return;
        }
        self.torn_down = true;

        info!(instance = %self.id, port = self.port, "Tearing down instance");
        self.process.stop(self.grace_period).await;
        self.workspace.destroy();
        self.lease.take();
    }
}

impl<P: ServerProduct> Drop for TestServer<P> {
    fn drop(&mut self) {
        if !self.torn_down {
            debug!(instance = %self.id, "Instance dropped without teardown, killing");
            self.process.kill_now();
            self.workspace.destroy();
        }
    }
}
