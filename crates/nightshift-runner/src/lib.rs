//! Runs the external job once inside a ready environment, under a hard
//! wall-clock deadline, with its output captured into the cycle log.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightshift_core::{JobSpec, RunOutcome};
use nightshift_env::{describe_command, EnvError, EnvironmentControl, EnvironmentHandle};
use nightshift_storage::CycleLog;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "nightshift-runner";

pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(7200);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const SIGKILL: i32 = 9;
/// Longer output lines are split into chunks of this size.
const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Environment(#[from] EnvError),
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lost track of job process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_lines: usize,
    pub detail: Option<String>,
}

pub struct BoundedJobRunner {
    control: Arc<dyn EnvironmentControl>,
    service: String,
    hard_timeout: Duration,
    drain_timeout: Duration,
}

impl BoundedJobRunner {
    pub fn new(
        control: Arc<dyn EnvironmentControl>,
        service: impl Into<String>,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            control,
            service: service.into(),
            hard_timeout,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// How long to keep collecting output after the job is gone.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn hard_timeout(&self) -> Duration {
        self.hard_timeout
    }

    /// Launch exactly one job process and wait for it, killing it when the
    /// hard timeout expires.
    pub async fn run(
        &self,
        handle: &EnvironmentHandle,
        job: &JobSpec,
        log: &CycleLog,
    ) -> Result<JobReport, RunnerError> {
        let mut command = self.control.exec_command(&self.service, job)?;
        let label = describe_command(&command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started_at = Utc::now();
        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            command: label.clone(),
            source,
        })?;
        info!(
            cycle = %handle.cycle_id(),
            pid = child.id(),
            command = %label,
            timeout_secs = self.hard_timeout.as_secs(),
            "job started"
        );

        let readers: Vec<JoinHandle<usize>> = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(pump(out, "stdout", log.clone()))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(pump(err, "stderr", log.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (status, timed_out) = match tokio::time::timeout(self.hard_timeout, child.wait()).await
        {
            Ok(Ok(status)) => (status, false),
            Ok(Err(err)) => {
                let _ = child.start_kill();
                self.drain(readers).await;
                return Err(RunnerError::Wait(err));
            }
            Err(_) => {
                warn!(
                    cycle = %handle.cycle_id(),
                    timeout_secs = self.hard_timeout.as_secs(),
                    "job exceeded hard timeout, killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(cycle = %handle.cycle_id(), error = %err, "kill failed");
                }
                let status = child.wait().await.map_err(RunnerError::Wait)?;
                (status, true)
            }
        };

        let output_lines = self.drain(readers).await;
        let finished_at = Utc::now();
        let report = classify(
            status,
            timed_out,
            self.hard_timeout,
            started_at,
            finished_at,
            output_lines,
        );
        info!(
            cycle = %handle.cycle_id(),
            outcome = %report.outcome,
            exit_code = ?report.exit_code,
            exit_signal = ?report.exit_signal,
            output_lines,
            "job finished"
        );
        Ok(report)
    }

    /// Wait a bounded time for the output readers. A reader still blocked on
    /// a pipe held open by a leftover grandchild is abandoned.
    async fn drain(&self, readers: Vec<JoinHandle<usize>>) -> usize {
        let mut total = 0;
        for mut reader in readers {
            match tokio::time::timeout(self.drain_timeout, &mut reader).await {
                Ok(Ok(lines)) => total += lines,
                Ok(Err(err)) => warn!(error = %err, "output reader failed"),
                Err(_) => {
                    reader.abort();
                    warn!("job output still open after exit; stopped capturing");
                }
            }
        }
        total
    }
}

fn classify(
    status: ExitStatus,
    timed_out: bool,
    hard_timeout: Duration,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    output_lines: usize,
) -> JobReport {
    let exit_code = status.code();
    let exit_signal = exit_signal(&status);

    let (outcome, detail) = if timed_out {
        (
            RunOutcome::TimedOut,
            Some(format!(
                "job exceeded hard timeout of {}s",
                hard_timeout.as_secs()
            )),
        )
    } else if status.success() {
        (RunOutcome::Success, None)
    } else {
        let detail = match (exit_code, exit_signal) {
            (Some(code), _) => format!("job exited with code {code}"),
            (None, Some(signal)) => format!("job terminated by signal {signal}"),
            (None, None) => "job ended without exit status".to_string(),
        };
        (RunOutcome::Failure, Some(detail))
    };

    JobReport {
        outcome,
        exit_code,
        exit_signal: if timed_out {
            exit_signal.or(Some(SIGKILL))
        } else {
            exit_signal
        },
        started_at,
        finished_at,
        output_lines,
        detail,
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Copy one output stream into the cycle log, one tagged line per line read.
async fn pump<R>(reader: R, stream: &'static str, log: CycleLog) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;
    loop {
        buf.clear();
        match (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = format!("[{stream}] {}", String::from_utf8_lossy(&buf));
                if let Err(err) = log.append_line(&line).await {
                    warn!(stream, error = %err, "failed to write job output");
                }
                lines += 1;
            }
            Err(err) => {
                warn!(stream, error = %err, "stopped reading job output");
                break;
            }
        }
    }
    lines
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nightshift_core::RunMode;
    use nightshift_env::{EnvironmentManager, ExecProbe, LocalControl};
    use nightshift_storage::RunLogStore;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    struct Fixture {
        _dir: TempDir,
        log: CycleLog,
        handle: EnvironmentHandle,
        control: Arc<dyn EnvironmentControl>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let log = RunLogStore::new(dir.path())
            .open_cycle_log(Utc::now(), Uuid::new_v4())
            .await
            .expect("log");
        let control: Arc<dyn EnvironmentControl> =
            Arc::new(LocalControl::new("nightshift").expect("control"));
        let manager = EnvironmentManager::new(
            control.clone(),
            Arc::new(ExecProbe::new(
                "app",
                JobSpec::new("true"),
                Duration::from_secs(5),
            )),
            Duration::from_millis(10),
        );
        let handle = manager.reset().await.expect("reset");
        Fixture {
            _dir: dir,
            log,
            handle,
            control,
        }
    }

    fn shell(script: &str) -> JobSpec {
        JobSpec::new("sh").arg("-c").arg(script)
    }

    async fn log_text(log: &CycleLog) -> String {
        log.seal().await.expect("seal");
        tokio::fs::read_to_string(log.path()).await.expect("read log")
    }

    #[tokio::test]
    async fn exit_zero_is_success_and_output_is_tagged() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        let report = runner
            .run(&fx.handle, &shell("echo hello; echo oops >&2"), &fx.log)
            .await
            .expect("run");

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.exit_signal, None);
        assert_eq!(report.output_lines, 2);
        assert!(report.finished_at >= report.started_at);

        let text = log_text(&fx.log).await;
        assert!(text.contains("[stdout] hello\n"));
        assert!(text.contains("[stderr] oops\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        let report = runner
            .run(&fx.handle, &shell("exit 3"), &fx.log)
            .await
            .expect("run");
        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.detail.as_deref(), Some("job exited with code 3"));
    }

    #[tokio::test]
    async fn overrunning_job_is_killed() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_millis(200));
        let started = std::time::Instant::now();
        let report = runner
            .run(&fx.handle, &JobSpec::new("sleep").arg("30"), &fx.log)
            .await
            .expect("run");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(report.exit_code, None);
        assert_eq!(report.exit_signal, Some(SIGKILL));
    }

    #[tokio::test]
    async fn leftover_grandchild_does_not_hold_the_runner() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_millis(300))
            .with_drain_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let report = runner
            .run(&fx.handle, &shell("echo begin; sleep 30 & sleep 30"), &fx.log)
            .await
            .expect("run");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert!(log_text(&fx.log).await.contains("[stdout] begin"));
    }

    #[tokio::test]
    async fn output_without_newlines_is_captured_in_bounded_chunks() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        let report = runner
            .run(
                &fx.handle,
                &shell("head -c 200000 /dev/zero | tr '\\000' x"),
                &fx.log,
            )
            .await
            .expect("run");
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.output_lines, 4);

        let text = log_text(&fx.log).await;
        let chunks = text
            .lines()
            .filter(|line| line.starts_with("[stdout] "))
            .map(|line| line.len() - "[stdout] ".len())
            .collect::<Vec<_>>();
        assert_eq!(chunks, vec![65536, 65536, 65536, 200000 - 3 * 65536]);
    }

    #[tokio::test]
    async fn job_sees_its_environment() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        let job = shell("echo mode=$AUTOMATION_MODE batch=$SCRAPER_BATCH_SIZE")
            .env("SCRAPER_BATCH_SIZE", "50")
            .with_run_mode(RunMode::Automated);
        runner.run(&fx.handle, &job, &fx.log).await.expect("run");
        assert!(log_text(&fx.log)
            .await
            .contains("[stdout] mode=true batch=50"));
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_kept_lossily() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        runner
            .run(&fx.handle, &shell("printf 'caf\\377\\n'"), &fx.log)
            .await
            .expect("run");
        assert!(log_text(&fx.log).await.contains("[stdout] caf\u{fffd}"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let fx = fixture().await;
        let runner = BoundedJobRunner::new(fx.control.clone(), "app", Duration::from_secs(10));
        let result = runner
            .run(
                &fx.handle,
                &JobSpec::new("/nonexistent/nightshift-job"),
                &fx.log,
            )
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
