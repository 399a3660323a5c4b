//! Disposable runtime environment for one scrape cycle: reset, readiness
//! polling and unconditional teardown.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nightshift_core::JobSpec;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nightshift-env";

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_NAME_LEN: usize = 64;
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid {kind} name `{name}`")]
    InvalidName { kind: &'static str, name: String },
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {limit:?}")]
    TimedOut { command: String, limit: Duration },
    #[error("`{command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },
}

/// Project and service names end up as command arguments, so only
/// `[A-Za-z0-9_.-]` is accepted.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

pub fn validate_name(kind: &'static str, name: &str) -> Result<(), EnvError> {
    if is_safe_name(name) {
        Ok(())
    } else {
        Err(EnvError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Program and arguments of a command, space separated, for logs and errors.
pub fn describe_command(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run a control command to completion under a time limit. The child is
/// killed if the limit expires.
pub async fn run_control(mut command: Command, limit: Duration) -> Result<Output, EnvError> {
    let label = describe_command(&command);
    command.stdin(Stdio::null()).kill_on_drop(true);
    debug!(command = %label, "running control command");

    let output = match tokio::time::timeout(limit, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(EnvError::Launch {
                command: label,
                source,
            })
        }
        Err(_) => {
            return Err(EnvError::TimedOut {
                command: label,
                limit,
            })
        }
    };

    if output.status.success() {
        Ok(output)
    } else {
        Err(EnvError::Failed {
            command: label,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn already_stopped(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container")
        || stderr.contains("is not running")
        || stderr.contains("no resource found")
}

/// Control surface of one named environment.
#[async_trait]
pub trait EnvironmentControl: Send + Sync {
    fn project(&self) -> &str;

    /// Stop everything belonging to the project. Nothing running is success.
    async fn stop(&self) -> Result<(), EnvError>;

    /// Remove stale resources labelled with this project only.
    async fn prune(&self) -> Result<(), EnvError>;

    /// Start the services detached.
    async fn start(&self) -> Result<(), EnvError>;

    /// Identifiers of running services.
    async fn status(&self) -> Result<Vec<String>, EnvError>;

    /// Command that runs `job` inside `service`. The caller decides how to
    /// spawn and bound it.
    fn exec_command(&self, service: &str, job: &JobSpec) -> Result<Command, EnvError>;
}

/// Docker Compose backend with an explicit project name.
#[derive(Debug, Clone)]
pub struct ComposeControl {
    project: String,
    compose_file: PathBuf,
    control_timeout: Duration,
}

impl ComposeControl {
    pub fn new(
        project: impl Into<String>,
        compose_file: impl Into<PathBuf>,
        control_timeout: Duration,
    ) -> Result<Self, EnvError> {
        let project = project.into();
        validate_name("project", &project)?;
        Ok(Self {
            project,
            compose_file: compose_file.into(),
            control_timeout,
        })
    }

    fn compose(&self) -> Command {
        let mut command = Command::new("docker");
        command
            .arg("compose")
            .arg("-p")
            .arg(&self.project)
            .arg("-f")
            .arg(&self.compose_file);
        command
    }

    fn status_command(&self) -> Command {
        let mut command = self.compose();
        command.args(["ps", "--status", "running", "-q"]);
        command
    }

    fn prune_command(&self, kind: &str) -> Command {
        let mut command = Command::new("docker");
        command
            .arg(kind)
            .args(["prune", "-f", "--filter"])
            .arg(format!("label={COMPOSE_PROJECT_LABEL}={}", self.project));
        command
    }
}

#[async_trait]
impl EnvironmentControl for ComposeControl {
    fn project(&self) -> &str {
        &self.project
    }

    async fn stop(&self) -> Result<(), EnvError> {
        let mut command = self.compose();
        command.args(["down", "--remove-orphans"]);
        match run_control(command, self.control_timeout).await {
            Ok(_) => Ok(()),
            Err(EnvError::Failed { stderr, .. }) if already_stopped(&stderr) => {
                debug!(project = %self.project, "environment already stopped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn prune(&self) -> Result<(), EnvError> {
        for kind in ["container", "network"] {
            run_control(self.prune_command(kind), self.control_timeout).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), EnvError> {
        let mut command = self.compose();
        command.args(["up", "-d"]);
        run_control(command, self.control_timeout).await?;
        Ok(())
    }

    async fn status(&self) -> Result<Vec<String>, EnvError> {
        let output = run_control(self.status_command(), self.control_timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn exec_command(&self, service: &str, job: &JobSpec) -> Result<Command, EnvError> {
        validate_name("service", service)?;
        let mut command = self.compose();
        command.args(["exec", "-T"]);
        for (key, value) in &job.env {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some(dir) = &job.working_dir {
            command.arg("-w").arg(dir);
        }
        command.arg(service).arg(&job.program).args(&job.args);
        Ok(command)
    }
}

/// Host backend: nothing to stop or start, jobs run as plain processes.
#[derive(Debug, Clone)]
pub struct LocalControl {
    project: String,
}

impl LocalControl {
    pub fn new(project: impl Into<String>) -> Result<Self, EnvError> {
        let project = project.into();
        validate_name("project", &project)?;
        Ok(Self { project })
    }
}

#[async_trait]
impl EnvironmentControl for LocalControl {
    fn project(&self) -> &str {
        &self.project
    }

    async fn stop(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn prune(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn status(&self) -> Result<Vec<String>, EnvError> {
        Ok(vec![format!("local:{}", self.project)])
    }

    fn exec_command(&self, service: &str, job: &JobSpec) -> Result<Command, EnvError> {
        validate_name("service", service)?;
        let mut command = Command::new(&job.program);
        command.args(&job.args).envs(&job.env);
        if let Some(dir) = &job.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    fn describe(&self) -> String;

    /// `Ok` once the environment accepts work.
    async fn check(&self, control: &dyn EnvironmentControl) -> Result<(), EnvError>;
}

/// Runs a short command inside a service and treats exit 0 as ready.
#[derive(Debug, Clone)]
pub struct ExecProbe {
    service: String,
    probe: JobSpec,
    limit: Duration,
}

impl ExecProbe {
    pub fn new(service: impl Into<String>, probe: JobSpec, limit: Duration) -> Self {
        Self {
            service: service.into(),
            probe,
            limit,
        }
    }

    pub fn pg_isready(service: impl Into<String>, user: &str, database: &str) -> Self {
        let probe = JobSpec::new("pg_isready")
            .arg("-U")
            .arg(user)
            .arg("-d")
            .arg(database);
        Self::new(service, probe, Duration::from_secs(10))
    }
}

#[async_trait]
impl ReadinessProbe for ExecProbe {
    fn describe(&self) -> String {
        format!("exec `{}` in {}", self.probe.display_command(), self.service)
    }

    async fn check(&self, control: &dyn EnvironmentControl) -> Result<(), EnvError> {
        let command = control.exec_command(&self.service, &self.probe)?;
        run_control(command, self.limit).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    limit: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, limit: Duration) -> Self {
        Self {
            addr: addr.into(),
            limit,
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp connect {}", self.addr)
    }

    async fn check(&self, _control: &dyn EnvironmentControl) -> Result<(), EnvError> {
        match tokio::time::timeout(self.limit, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(EnvError::Unreachable {
                target: self.addr.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(EnvError::Unreachable {
                target: self.addr.clone(),
                reason: format!("no answer within {}s", self.limit.as_secs()),
            }),
        }
    }
}

/// The environment of exactly one cycle. Consumed by
/// [`EnvironmentManager::teardown`].
#[derive(Debug, PartialEq, Eq)]
pub struct EnvironmentHandle {
    cycle_id: Uuid,
    project: String,
    started_at: DateTime<Utc>,
}

impl EnvironmentHandle {
    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

pub struct EnvironmentManager {
    control: Arc<dyn EnvironmentControl>,
    probe: Arc<dyn ReadinessProbe>,
    poll_interval: Duration,
}

impl EnvironmentManager {
    pub fn new(
        control: Arc<dyn EnvironmentControl>,
        probe: Arc<dyn ReadinessProbe>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            control,
            probe,
            poll_interval,
        }
    }

    pub fn control(&self) -> &Arc<dyn EnvironmentControl> {
        &self.control
    }

    /// Stop leftovers, prune this project's stale resources, start fresh.
    ///
    /// A failed prune is logged and does not block the start; failing to
    /// stop or start is fatal for the cycle.
    pub async fn reset(&self) -> Result<EnvironmentHandle, EnvError> {
        let project = self.control.project().to_string();

        info!(project = %project, "stopping leftover environment");
        self.control.stop().await?;

        if let Err(err) = self.control.prune().await {
            warn!(project = %project, error = %err, "scoped prune failed");
        }

        self.control.start().await?;
        let handle = EnvironmentHandle {
            cycle_id: Uuid::new_v4(),
            project,
            started_at: Utc::now(),
        };
        match self.control.status().await {
            Ok(running) => info!(
                project = %handle.project,
                cycle = %handle.cycle_id,
                services = running.len(),
                "environment started"
            ),
            Err(err) => warn!(
                project = %handle.project,
                cycle = %handle.cycle_id,
                error = %err,
                "environment started; status unavailable"
            ),
        }
        Ok(handle)
    }

    pub async fn await_ready(&self, handle: &EnvironmentHandle, timeout: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let reason = match tokio::time::timeout_at(
                deadline,
                self.probe.check(self.control.as_ref()),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(cycle = %handle.cycle_id, attempts, "environment ready");
                    return Readiness::Ready { attempts };
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("{} did not answer", self.probe.describe()),
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(cycle = %handle.cycle_id, attempts, reason = %reason, "environment not ready");
                return Readiness::Failed {
                    attempts,
                    reason: format!("not ready after {}s: {reason}", timeout.as_secs()),
                };
            }
            debug!(cycle = %handle.cycle_id, attempts, reason = %reason, "waiting for readiness");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Stop the environment whether or not a handle was ever produced.
    /// Stopping an already stopped environment succeeds.
    pub async fn teardown(&self, handle: Option<EnvironmentHandle>) -> Result<(), EnvError> {
        match &handle {
            Some(handle) => info!(cycle = %handle.cycle_id, "tearing down environment"),
            None => info!(project = %self.control.project(), "tearing down environment without handle"),
        }
        self.control.stop().await
    }
}
