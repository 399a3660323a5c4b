//! Daily scrape cycle: wait for the trigger, reset the environment, run the
//! job under its deadline, tear down, record the run.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nightshift_core::{Clock, JobSpec, RunOutcome, RunRecord, ScheduleState};
use nightshift_env::{
    ComposeControl, EnvError, EnvironmentControl, EnvironmentHandle, EnvironmentManager,
    ExecProbe, LocalControl, Readiness, ReadinessProbe, TcpProbe,
};
use nightshift_runner::{BoundedJobRunner, JobReport, RunnerError};
use nightshift_storage::{CycleLog, RunLogStore};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;

pub use config::{Backend, ConfigError, DbSettings, OrchestratorConfig};

pub const CRATE_NAME: &str = "nightshift-orchestrator";

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Waiting { until: DateTime<Utc> },
    Resetting,
    AwaitingReady,
    Running,
    Finalizing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Idle => f.write_str("idle"),
            CyclePhase::Waiting { until } => write!(f, "waiting until {}", until.to_rfc3339()),
            CyclePhase::Resetting => f.write_str("resetting"),
            CyclePhase::AwaitingReady => f.write_str("awaiting_ready"),
            CyclePhase::Running => f.write_str("running"),
            CyclePhase::Finalizing => f.write_str("finalizing"),
        }
    }
}

/// Why a cycle ended before or instead of a job result.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle log unavailable: {0}")]
    Log(String),
    #[error("environment reset failed: {0}")]
    Reset(#[source] EnvError),
    #[error("environment not ready: {0}")]
    NotReady(String),
    #[error("job could not be run: {0}")]
    Runner(#[from] RunnerError),
}

pub struct Orchestrator {
    schedule: ScheduleState,
    clock: Arc<dyn Clock>,
    environment: EnvironmentManager,
    runner: BoundedJobRunner,
    logs: RunLogStore,
    job: JobSpec,
    ready_timeout: Duration,
    poll_interval: Duration,
    liveness_interval: Duration,
    phase: CyclePhase,
}

impl Orchestrator {
    pub fn new(
        schedule: ScheduleState,
        clock: Arc<dyn Clock>,
        environment: EnvironmentManager,
        runner: BoundedJobRunner,
        logs: RunLogStore,
        job: JobSpec,
    ) -> Self {
        Self {
            schedule,
            clock,
            environment,
            runner,
            logs,
            job,
            ready_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(600),
            phase: CyclePhase::Idle,
        }
    }

    pub fn with_timing(
        mut self,
        ready_timeout: Duration,
        poll_interval: Duration,
        liveness_interval: Duration,
    ) -> Self {
        self.ready_timeout = ready_timeout;
        self.poll_interval = poll_interval;
        self.liveness_interval = liveness_interval;
        self
    }

    /// Wire the configured backend, probe, runner and log store.
    pub fn from_config(
        config: &OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let trigger = config.trigger()?;
        let invalid = |key: &'static str| {
            move |err: EnvError| ConfigError::Invalid {
                key,
                reason: err.to_string(),
            }
        };

        let control: Arc<dyn EnvironmentControl> = match config.backend {
            Backend::Compose => Arc::new(
                ComposeControl::new(
                    config.project.clone(),
                    config.compose_file.clone(),
                    config.control_timeout,
                )
                .map_err(invalid("NIGHTSHIFT_PROJECT"))?,
            ),
            Backend::Local => Arc::new(
                LocalControl::new(config.project.clone())
                    .map_err(invalid("NIGHTSHIFT_PROJECT"))?,
            ),
        };
        let probe: Arc<dyn ReadinessProbe> = match config.backend {
            Backend::Compose => Arc::new(ExecProbe::pg_isready(
                config.storage_service.clone(),
                &config.db.user,
                &config.db.name,
            )),
            Backend::Local => Arc::new(TcpProbe::new(
                format!("{}:{}", config.db.host, config.db.port),
                TCP_PROBE_TIMEOUT,
            )),
        };

        let schedule = ScheduleState::at_startup(trigger, clock.now());
        let environment = EnvironmentManager::new(control.clone(), probe, config.ready_poll);
        let runner =
            BoundedJobRunner::new(control, config.app_service.clone(), config.job_timeout);

        Ok(Self::new(
            schedule,
            clock,
            environment,
            runner,
            RunLogStore::new(config.log_dir.clone()),
            config.job_spec()?,
        )
        .with_timing(
            config.ready_timeout,
            config.poll_interval,
            config.liveness_interval,
        ))
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn phase(&self) -> &CyclePhase {
        &self.phase
    }

    pub fn logs(&self) -> &RunLogStore {
        &self.logs
    }

    /// Loop until stopped: wait for each trigger, run one cycle, advance the
    /// schedule. Returns the number of cycles run.
    pub async fn run_forever(&mut self, mut stop: watch::Receiver<bool>) -> usize {
        info!(
            trigger = %self.schedule.trigger,
            next_trigger = %self.schedule.trigger.to_local(self.schedule.next_trigger_at),
            "orchestrator started"
        );

        let mut cycles = 0usize;
        loop {
            if !self.wait_until_due(&mut stop).await {
                info!("stop requested while waiting");
                break;
            }

            let trigger_at = self.schedule.next_trigger_at;
            let record = self.run_cycle(trigger_at, &stop).await;
            cycles += 1;
            self.schedule.complete(record.finished_at);
            info!(
                outcome = %record.outcome,
                next_trigger = %self.schedule.trigger.to_local(self.schedule.next_trigger_at),
                "cycle complete"
            );

            if record.stop_requested || *stop.borrow() {
                info!("stop requested during cycle, exiting after finalize");
                break;
            }
        }
        self.enter(CyclePhase::Idle, None).await;
        cycles
    }

    /// One cycle right now, without consuming the scheduled trigger.
    pub async fn run_once(&mut self, stop: &watch::Receiver<bool>) -> RunRecord {
        let trigger_at = self.clock.now();
        let record = self.run_cycle(trigger_at, stop).await;
        self.enter(CyclePhase::Idle, None).await;
        record
    }

    /// Resetting through Finalizing. Teardown runs exactly once whatever
    /// fails, and the finalized record is appended to the ledger.
    pub async fn run_cycle(
        &mut self,
        trigger_at: DateTime<Utc>,
        stop: &watch::Receiver<bool>,
    ) -> RunRecord {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", run = %run_id);
        self.cycle(run_id, trigger_at, stop).instrument(span).await
    }

    async fn cycle(
        &mut self,
        run_id: Uuid,
        trigger_at: DateTime<Utc>,
        stop: &watch::Receiver<bool>,
    ) -> RunRecord {
        let started_at = self.clock.now();
        info!(trigger_at = %trigger_at, "cycle starting");

        let (log, log_path) = match self.logs.open_cycle_log(started_at, run_id).await {
            Ok(log) => {
                let path = log.path().to_path_buf();
                (Some(log), path)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not open cycle log");
                let path = self
                    .logs
                    .root()
                    .join(self.logs.cycle_log_relative_path(started_at, run_id));
                (None, path)
            }
        };

        let mut handle: Option<EnvironmentHandle> = None;
        let result = match &log {
            Some(log) => self.drive(log, &mut handle).await,
            None => Err(CycleError::Log(log_path.display().to_string())),
        };

        self.enter(CyclePhase::Finalizing, log.as_ref()).await;
        let (outcome, exit_code, exit_signal, mut detail) = match result {
            Ok(report) => (
                report.outcome,
                report.exit_code,
                report.exit_signal,
                report.detail,
            ),
            Err(err) => {
                error!(error = %err, "cycle failed");
                (RunOutcome::EnvironmentError, None, None, Some(err.to_string()))
            }
        };

        if let Err(err) = self.environment.teardown(handle).await {
            warn!(error = %err, "teardown failed; the next reset will clean up");
            let note = format!("teardown failed: {err}");
            detail = Some(match detail {
                Some(existing) => format!("{existing}; {note}"),
                None => note,
            });
        }

        let stop_requested = *stop.borrow();
        let finished_at = self.clock.now();
        let log_sha256 = match &log {
            Some(log) => {
                mark(log, &format!("outcome {outcome}")).await;
                match log.seal().await {
                    Ok(digest) => Some(digest),
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "could not seal cycle log");
                        None
                    }
                }
            }
            None => None,
        };

        let record = RunRecord {
            run_id,
            trigger_at,
            started_at,
            finished_at,
            outcome,
            exit_code,
            exit_signal,
            log_path,
            log_sha256,
            detail,
            stop_requested,
        };

        if let Err(err) = self.logs.append_record(&record).await {
            error!(error = %format!("{err:#}"), "could not append run ledger");
        }
        info!(outcome = %record.outcome, exit_code = ?record.exit_code, "cycle finalized");
        record
    }

    /// Resetting, AwaitingReady and Running. The handle is left in `slot`
    /// so teardown sees it even when a later phase fails.
    async fn drive(
        &mut self,
        log: &CycleLog,
        slot: &mut Option<EnvironmentHandle>,
    ) -> Result<JobReport, CycleError> {
        self.enter(CyclePhase::Resetting, Some(log)).await;
        let handle = slot.insert(self.environment.reset().await.map_err(CycleError::Reset)?);

        self.enter(CyclePhase::AwaitingReady, Some(log)).await;
        if let Readiness::Failed { reason, .. } =
            self.environment.await_ready(handle, self.ready_timeout).await
        {
            return Err(CycleError::NotReady(reason));
        }

        self.enter(CyclePhase::Running, Some(log)).await;
        mark(log, &format!("job {}", self.job.display_command())).await;
        Ok(self.runner.run(handle, &self.job, log).await?)
    }

    /// Sleep in bounded steps until the next trigger is due. Returns `false`
    /// if a stop was requested first.
    async fn wait_until_due(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        let until = self.schedule.next_trigger_at;
        self.enter(CyclePhase::Waiting { until }, None).await;

        let mut stop_open = true;
        let mut last_liveness = self.clock.now();
        loop {
            if *stop.borrow() {
                return false;
            }
            let now = self.clock.now();
            if self.schedule.is_due(now) {
                return true;
            }

            let since_liveness = (now - last_liveness).to_std().unwrap_or(Duration::ZERO);
            if since_liveness >= self.liveness_interval {
                info!(
                    next_trigger = %self.schedule.trigger.to_local(until),
                    remaining_secs = self.schedule.remaining(now).as_secs(),
                    "waiting for next trigger"
                );
                last_liveness = now;
            }

            let nap = self
                .poll_interval
                .min(self.schedule.remaining(now))
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                    }
                }
            }
        }
    }

    async fn enter(&mut self, phase: CyclePhase, log: Option<&CycleLog>) {
        info!(phase = %phase, "phase");
        if let Some(log) = log {
            mark(log, &format!("phase {phase}")).await;
        }
        self.phase = phase;
    }
}

async fn mark(log: &CycleLog, message: &str) {
    if let Err(err) = log.mark(message).await {
        warn!(error = %format!("{err:#}"), "could not write cycle log marker");
    }
}

/// systemd unit that keeps the orchestrator alive across crashes and boots.
///
/// `KillMode=mixed` sends SIGTERM to the orchestrator only, and the stop
/// timeout leaves room for a running cycle to finish its job and teardown.
pub fn render_systemd_unit(config: &OrchestratorConfig, exe: &Path, workdir: &Path) -> String {
    let stop_budget = config.job_timeout + config.ready_timeout + config.control_timeout * 4;
    let mut unit = vec![
        "[Unit]".to_string(),
        format!("Description=Nightshift scrape orchestrator ({})", config.project),
        "Wants=network-online.target".to_string(),
    ];
    match config.backend {
        Backend::Compose => {
            unit.push("After=network-online.target docker.service".to_string());
            unit.push("Requires=docker.service".to_string());
        }
        Backend::Local => unit.push("After=network-online.target".to_string()),
    }
    unit.extend([
        "StartLimitIntervalSec=3600".to_string(),
        "StartLimitBurst=5".to_string(),
        String::new(),
        "[Service]".to_string(),
        "Type=simple".to_string(),
        format!("WorkingDirectory={}", workdir.display()),
        format!("ExecStart={} run", exe.display()),
        "Environment=RUST_LOG=nightshift=info".to_string(),
        "Restart=always".to_string(),
        "RestartSec=60".to_string(),
        "KillMode=mixed".to_string(),
        "KillSignal=SIGTERM".to_string(),
        format!("TimeoutStopSec={}", stop_budget.as_secs()),
        "MemoryMax=2G".to_string(),
        "CPUQuota=200%".to_string(),
        String::new(),
        "[Install]".to_string(),
        "WantedBy=multi-user.target".to_string(),
        String::new(),
    ]);
    unit.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use nightshift_core::{DailyTrigger, ManualClock};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use tokio::process::Command;

    #[derive(Default)]
    struct FakeControl {
        calls: Mutex<Vec<&'static str>>,
        fail_stop: bool,
        fail_start: bool,
    }

    impl FakeControl {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }

        fn record(&self, call: &'static str, fail: bool) -> Result<(), EnvError> {
            self.calls.lock().unwrap().push(call);
            if fail {
                Err(EnvError::Failed {
                    command: format!("docker compose {call}"),
                    status: "exit status: 1".into(),
                    stderr: "daemon unavailable".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EnvironmentControl for FakeControl {
        fn project(&self) -> &str {
            "nightshift-test"
        }
        async fn stop(&self) -> Result<(), EnvError> {
            self.record("stop", self.fail_stop)
        }
        async fn prune(&self) -> Result<(), EnvError> {
            self.record("prune", false)
        }
        async fn start(&self) -> Result<(), EnvError> {
            self.record("start", self.fail_start)
        }
        async fn status(&self) -> Result<Vec<String>, EnvError> {
            Ok(Vec::new())
        }
        fn exec_command(&self, _service: &str, job: &JobSpec) -> Result<Command, EnvError> {
            self.calls.lock().unwrap().push("exec");
            let mut command = Command::new(&job.program);
            command.args(&job.args).envs(&job.env);
            Ok(command)
        }
    }

    struct FixedProbe {
        ready: AtomicBool,
    }

    #[async_trait]
    impl ReadinessProbe for FixedProbe {
        fn describe(&self) -> String {
            "fixed".into()
        }
        async fn check(&self, _control: &dyn EnvironmentControl) -> Result<(), EnvError> {
            if self.ready.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(EnvError::Unreachable {
                    target: "postgres".into(),
                    reason: "connection refused".into(),
                })
            }
        }
    }

    struct Harness {
        dir: TempDir,
        control: Arc<FakeControl>,
        orchestrator: Orchestrator,
    }

    /// 02:00 +07:00 on 2026-03-02.
    fn trigger_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).single().unwrap()
    }

    fn harness(control: FakeControl, ready: bool, script: &str, hard_timeout: Duration) -> Harness {
        let dir = tempdir().expect("tempdir");
        harness_in(dir, control, ready, script, hard_timeout, None)
    }

    fn harness_in(
        dir: TempDir,
        control: FakeControl,
        ready: bool,
        script: &str,
        hard_timeout: Duration,
        log_root: Option<PathBuf>,
    ) -> Harness {
        let control = Arc::new(control);
        let clock = Arc::new(ManualClock::new(trigger_instant()));
        let trigger = DailyTrigger::parse("02:00", "+07:00").unwrap();
        let schedule = ScheduleState::at_startup(trigger, clock.now());
        let environment = EnvironmentManager::new(
            control.clone(),
            Arc::new(FixedProbe {
                ready: AtomicBool::new(ready),
            }),
            Duration::from_millis(10),
        );
        let runner = BoundedJobRunner::new(control.clone(), "job-scraper", hard_timeout)
            .with_drain_timeout(Duration::from_millis(200));
        let logs = RunLogStore::new(log_root.unwrap_or_else(|| dir.path().join("logs")));
        let job = JobSpec::new("sh").arg("-c").arg(script);
        let orchestrator = Orchestrator::new(schedule, clock, environment, runner, logs, job)
            .with_timing(
                Duration::from_millis(60),
                Duration::from_millis(10),
                Duration::from_secs(600),
            );
        Harness {
            dir,
            control,
            orchestrator,
        }
    }

    fn no_stop() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn successful_cycle_is_recorded_and_torn_down() {
        let mut h = harness(
            FakeControl::default(),
            true,
            "echo scraped 12 jobs",
            Duration::from_secs(10),
        );
        let (_tx, rx) = no_stop();
        assert!(h.orchestrator.schedule().is_due(trigger_instant()));

        let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
        assert_eq!(record.outcome, RunOutcome::Success);
        assert_eq!(record.exit_code, Some(0));
        assert!(!record.stop_requested);
        assert_eq!(
            h.control.calls(),
            vec!["stop", "prune", "start", "exec", "stop"]
        );

        let text = std::fs::read_to_string(&record.log_path).unwrap();
        assert!(text.contains("phase resetting"));
        assert!(text.contains("phase running"));
        assert!(text.contains("[stdout] scraped 12 jobs"));
        assert!(text.contains("phase finalizing"));
        assert_eq!(
            record.log_sha256.as_deref(),
            Some(RunLogStore::sha256_hex(text.as_bytes()).as_str())
        );

        let ledger = h.orchestrator.logs().recent_records(10).await.unwrap();
        assert_eq!(ledger, vec![record]);
        assert_eq!(h.orchestrator.phase(), &CyclePhase::Finalizing);
    }

    #[tokio::test]
    async fn overrunning_job_times_out_and_is_torn_down() {
        let mut h = harness(
            FakeControl::default(),
            true,
            "sleep 30",
            Duration::from_millis(200),
        );
        let (_tx, rx) = no_stop();
        let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
        assert_eq!(record.outcome, RunOutcome::TimedOut);
        assert_eq!(record.exit_signal, Some(9));
        assert_eq!(h.control.count("stop"), 2);
        assert_eq!(h.control.calls().last(), Some(&"stop"));
    }

    #[tokio::test]
    async fn readiness_timeout_skips_the_job() {
        let mut h = harness(FakeControl::default(), false, "true", Duration::from_secs(10));
        let marker = h.dir.path().join("job-ran");
        h.orchestrator.job = JobSpec::new("touch").arg(marker.display().to_string());
        let (_tx, rx) = no_stop();

        let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
        assert_eq!(record.outcome, RunOutcome::EnvironmentError);
        assert!(record
            .detail
            .as_deref()
            .unwrap()
            .contains("connection refused"));
        assert!(!marker.exists());
        assert_eq!(h.control.count("exec"), 0);
        assert_eq!(h.control.count("stop"), 2);
    }

    #[tokio::test]
    async fn teardown_runs_once_whichever_stage_fails() {
        let cases: Vec<(FakeControl, bool, &str, RunOutcome)> = vec![
            (
                FakeControl {
                    fail_stop: true,
                    ..FakeControl::default()
                },
                true,
                "true",
                RunOutcome::EnvironmentError,
            ),
            (
                FakeControl {
                    fail_start: true,
                    ..FakeControl::default()
                },
                true,
                "true",
                RunOutcome::EnvironmentError,
            ),
            (FakeControl::default(), false, "true", RunOutcome::EnvironmentError),
            (FakeControl::default(), true, "exit 4", RunOutcome::Failure),
            (FakeControl::default(), true, "true", RunOutcome::Success),
        ];

        for (control, ready, script, expected) in cases {
            let mut h = harness(control, ready, script, Duration::from_secs(10));
            let (_tx, rx) = no_stop();
            let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
            assert_eq!(record.outcome, expected, "script {script}");

            // reset stops once, teardown stops once
            let calls = h.control.calls();
            assert_eq!(h.control.count("stop"), 2, "calls {calls:?}");
            assert_eq!(calls.last(), Some(&"stop"));
            if expected == RunOutcome::EnvironmentError {
                assert_eq!(h.control.count("exec"), 0);
            }
        }
    }

    #[tokio::test]
    async fn unwritable_log_directory_still_tears_down() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let mut h = harness_in(
            dir,
            FakeControl::default(),
            true,
            "true",
            Duration::from_secs(10),
            Some(blocker.join("logs")),
        );
        let (_tx, rx) = no_stop();

        let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
        assert_eq!(record.outcome, RunOutcome::EnvironmentError);
        assert_eq!(record.log_sha256, None);
        assert_eq!(h.control.calls(), vec!["stop"]);
    }

    #[tokio::test]
    async fn stop_during_cycle_is_recorded() {
        let mut h = harness(FakeControl::default(), true, "true", Duration::from_secs(10));
        let (tx, rx) = no_stop();
        tx.send(true).unwrap();
        let record = h.orchestrator.run_cycle(trigger_instant(), &rx).await;
        assert!(record.stop_requested);
        assert_eq!(record.outcome, RunOutcome::Success);
    }

    #[tokio::test]
    async fn loop_runs_due_cycle_then_waits_for_next_day() {
        let h = harness(FakeControl::default(), true, "true", Duration::from_secs(10));
        let Harness {
            dir: _dir,
            control,
            mut orchestrator,
        } = h;
        let logs = orchestrator.logs().clone();
        let (tx, rx) = no_stop();

        let task = tokio::spawn(async move {
            let cycles = orchestrator.run_forever(rx).await;
            (orchestrator, cycles)
        });

        let mut recorded = Vec::new();
        for _ in 0..250 {
            recorded = logs.recent_records(10).await.unwrap();
            if !recorded.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(recorded.len(), 1);

        tx.send(true).unwrap();
        let (orchestrator, cycles) = task.await.unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(
            orchestrator.schedule().next_trigger_at,
            trigger_instant() + chrono::Duration::days(1)
        );
        assert_eq!(orchestrator.phase(), &CyclePhase::Idle);
        assert_eq!(control.count("exec"), 1);
    }

    #[tokio::test]
    async fn stop_while_waiting_has_no_side_effects() {
        let mut h = harness(FakeControl::default(), true, "true", Duration::from_secs(10));
        h.orchestrator.schedule = ScheduleState::at_startup(
            h.orchestrator.schedule.trigger,
            trigger_instant() + chrono::Duration::minutes(5),
        );
        let (tx, rx) = no_stop();
        tx.send(true).unwrap();

        let cycles = h.orchestrator.run_forever(rx).await;
        assert_eq!(cycles, 0);
        assert!(h.control.calls().is_empty());
        assert!(h.orchestrator.logs().recent_records(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_once_keeps_the_scheduled_trigger() {
        let mut h = harness(FakeControl::default(), true, "true", Duration::from_secs(10));
        let before = h.orchestrator.schedule().clone();
        let (_tx, rx) = no_stop();
        let record = h.orchestrator.run_once(&rx).await;
        assert_eq!(record.outcome, RunOutcome::Success);
        assert_eq!(h.orchestrator.schedule(), &before);
    }

    #[test]
    fn systemd_unit_restarts_and_limits_resources() {
        let config = OrchestratorConfig::from_lookup(|_| None).unwrap();
        let unit = render_systemd_unit(
            &config,
            Path::new("/usr/local/bin/nightshift"),
            Path::new("/srv/nightshift"),
        );
        assert!(unit.contains("ExecStart=/usr/local/bin/nightshift run"));
        assert!(unit.contains("WorkingDirectory=/srv/nightshift"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("KillMode=mixed"));
        assert!(unit.contains("RestartSec=60"));
        assert!(unit.contains("MemoryMax="));
        assert!(unit.contains("CPUQuota="));
        assert!(unit.contains("Requires=docker.service"));
        assert!(unit.contains("TimeoutStopSec=8520"));
    }
}
