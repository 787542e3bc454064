//! Supervision of the external server process
//!
//! State machine:
//!
//! ```text
//! Starting -> Running -> Stopping -> Stopped
//!     |
//!     +-> Failed   (exited before ready)
//! ```
//!
//! A process that cannot be executed never gets a [`ServerProcess`]; `spawn`
//! returns the OS error instead. `Failed` and `Stopped` are terminal. Stopping sends SIGTERM, waits up to a
//! grace period, then sends SIGKILL. Stopping a process that is not running is
//! a no-op.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{FixtureError, Result};
use crate::workspace;

/// Lines of stderr included in early-exit errors
const STDERR_TAIL_LINES: usize = 20;

/// State of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, readiness not yet confirmed
    Starting,
    /// Readiness confirmed
    Running,
    /// Termination in progress
    Stopping,
    /// Process has exited after a stop request
    Stopped,
    /// Exited before becoming ready
    Failed,
}

impl ProcessState {
    /// Whether an OS process handle is held in this state
    pub fn holds_handle(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

/// Everything needed to launch a server process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Set DEBUG=1 in the child's environment only
    pub debug: bool,
    /// Redirect stdout/stderr into this directory; inherited when `None`
    pub log_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            debug: false,
            log_dir: None,
        }
    }

    /// Build from an argv whose first element is the program
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter.next()?;
        Some(Self::new(program).with_args(iter))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .to_string()
    }
}

/// Locate `program` as an absolute path: paths are resolved against the
/// current directory, bare names are searched on PATH
pub fn resolve_program(program: &Path) -> Result<PathBuf> {
    let missing = || FixtureError::MissingDependency {
        what: "executable".to_string(),
        path: program.to_path_buf(),
    };

    if program.components().count() > 1 || program.is_absolute() {
        if !program.is_file() {
            return Err(missing());
        }
        // The child runs with its own cwd, so a relative path must be pinned here
        return std::env::current_dir()
            .map(|cwd| cwd.join(program))
            .map_err(|e| FixtureError::Spawn {
                program: program.display().to_string(),
                source: e,
            });
    }

    let path_var = std::env::var_os("PATH").ok_or_else(missing)?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(missing)
}

fn log_stdio(dir: &Path, name: &str) -> Result<Stdio> {
    let path = dir.join(name);
    let file = File::create(&path).map_err(|e| FixtureError::workspace(&path, e))?;
    Ok(Stdio::from(file))
}

/// A supervised child process
#[derive(Debug)]
pub struct ServerProcess {
    program: String,
    child: Option<Child>,
    pid: Option<u32>,
    state: ProcessState,
    stderr_log: Option<PathBuf>,
}

impl ServerProcess {
    /// Spawn the process described by `spec`. Must be called within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let program = resolve_program(&spec.program)?;
        let name = spec.program_name();

        info!(program = %program.display(), args = ?spec.args, "Starting server process");

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if spec.debug {
            cmd.env("DEBUG", "1");
        }

        let stderr_log = match spec.log_dir {
            Some(ref dir) => {
                cmd.stdout(log_stdio(dir, "stdout.log")?);
                cmd.stderr(log_stdio(dir, "stderr.log")?);
                Some(dir.join("stderr.log"))
            }
            None => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
                None
            }
        };

        let child = cmd.spawn().map_err(|e| FixtureError::Spawn {
            program: program.display().to_string(),
            source: e,
        })?;
        let pid = child.id();
        info!(program = %name, pid, "Server process spawned");

        Ok(Self {
            program: name,
            child: Some(child),
            pid,
            state: ProcessState::Starting,
            stderr_log,
        })
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Record that readiness has been confirmed
    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }
    }

    /// Fail if the process has exited on its own
    pub fn check_alive(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                self.child = None;
                self.state = ProcessState::Failed;
                let stderr_tail = self
                    .stderr_log
                    .as_deref()
                    .map(|p| workspace::tail(p, STDERR_TAIL_LINES))
                    .unwrap_or_default();
                warn!(program = %self.program, pid = self.pid, %status, "Server process exited unexpectedly");
                Err(FixtureError::ExitedEarly {
                    program: self.program.clone(),
                    status: status.to_string(),
                    stderr_tail,
                })
            }
            Err(e) => {
                debug!(program = %self.program, error = %e, "Could not poll process status");
                Ok(())
            }
        }
    }

    /// Terminate gracefully, then forcefully after `grace_period`. Idempotent.
    pub async fn stop(&mut self, grace_period: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.state = ProcessState::Stopping;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(program = %self.program, %status, "Process already exited");
            self.state = ProcessState::Stopped;
            return;
        }

        if let Some(pid) = child.id() {
            info!(program = %self.program, pid, "Sending SIGTERM to server process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(program = %self.program, ?status, "Server process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "Error waiting for server process to exit");
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    grace_period_ms = grace_period.as_millis(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = child.kill().await {
                    warn!(program = %self.program, error = %e, "Failed to kill server process");
                }
            }
        }

        self.state = ProcessState::Stopped;
    }

    /// Send SIGKILL without waiting; used where no runtime is available
    pub fn kill_now(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(program = %self.program, error = %e, "Kill on drop failed");
            }
            self.state = ProcessState::Stopped;
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_resolve_program_on_path() {
        let resolved = resolve_program(Path::new("sh")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_resolve_missing_program() {
        let err = resolve_program(Path::new("/definitely/not/here/httpd")).unwrap_err();
        assert!(err.is_dependency());

        let err = resolve_program(Path::new("no-such-binary-ephemeral-server")).unwrap_err();
        assert!(err.is_dependency());
    }

    #[test]
    fn test_resolve_relative_path_is_absolute() {
        let dir = tempfile::tempdir_in(".").unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        let relative = PathBuf::from(dir.path().file_name().unwrap()).join("server.sh");

        let resolved = resolve_program(&relative).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_relative_path_with_other_cwd() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir_in(".").unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let relative = PathBuf::from(dir.path().file_name().unwrap()).join("server.sh");

        let elsewhere = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(&relative).with_cwd(elsewhere.path());
        let mut process = ServerProcess::spawn(&spec).unwrap();
        process.check_alive().unwrap();
        process.stop(Duration::from_secs(2)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_launch_spec_from_argv() {
        let spec = LaunchSpec::from_argv(["/usr/sbin/httpd", "-f", "/tmp/httpd.conf"]).unwrap();
        assert_eq!(spec.program, PathBuf::from("/usr/sbin/httpd"));
        assert_eq!(spec.args, vec![OsString::from("-f"), OsString::from("/tmp/httpd.conf")]);
        assert_eq!(spec.program_name(), "httpd");
        assert!(LaunchSpec::from_argv(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_state_holds_handle() {
        assert!(ProcessState::Starting.holds_handle());
        assert!(ProcessState::Running.holds_handle());
        assert!(ProcessState::Stopping.holds_handle());
        assert!(!ProcessState::Stopped.holds_handle());
        assert!(!ProcessState::Failed.holds_handle());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_dependency_error() {
        let err = ServerProcess::spawn(&LaunchSpec::new("/nonexistent/bin/server")).unwrap_err();
        assert!(err.is_dependency());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut process = ServerProcess::spawn(&LaunchSpec::new("sleep").with_args(["60"])).unwrap();
        assert_eq!(process.state(), ProcessState::Starting);
        assert!(process.pid().is_some());
        process.check_alive().unwrap();

        process.mark_running();
        assert_eq!(process.state(), ProcessState::Running);

        let start = Instant::now();
        process.stop(Duration::from_secs(5)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
        // sleep exits on SIGTERM, well inside the grace period
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut process = ServerProcess::spawn(&LaunchSpec::new("sleep").with_args(["60"])).unwrap();
        process.stop(Duration::from_secs(1)).await;
        process.stop(Duration::from_secs(1)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        // Ignores SIGTERM, so only SIGKILL ends it
        let spec = LaunchSpec::new("sh").with_args(["-c", "trap '' TERM; exec sleep 60"]);
        let mut process = ServerProcess::spawn(&spec).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        process.stop(Duration::from_millis(300)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_early_exit_is_failed_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("sh")
            .with_args(["-c", "echo 'bad config line 3' >&2; exit 3"])
            .with_log_dir(dir.path());
        let mut process = ServerProcess::spawn(&spec).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            if let Err(e) = process.check_alive() {
                break e;
            }
            assert!(Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        assert_eq!(process.state(), ProcessState::Failed);
        let msg = err.to_string();
        assert!(msg.contains("bad config line 3"), "{}", msg);

        // Stop after failure is a no-op
        process.stop(Duration::from_secs(1)).await;
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_debug_flag_scoped_to_child() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("sh")
            .with_args(["-c", "echo \"DEBUG=$DEBUG\""])
            .with_debug(true)
            .with_log_dir(dir.path());
        let mut process = ServerProcess::spawn(&spec).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.check_alive().is_ok() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let out = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        assert_eq!(out.trim(), "DEBUG=1");
    }
}
