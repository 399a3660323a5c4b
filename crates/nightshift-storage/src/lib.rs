//! Append-only run logs and the listing consistency engine for Nightshift.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use nightshift_core::RunRecord;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub mod consistency;
pub mod postgres;

pub use consistency::{
    CommittedListing, ConsistencyEngine, MemoryRecordStore, RecordStore, StampedListing,
    StoreError,
};
pub use postgres::PgRecordStore;

pub const CRATE_NAME: &str = "nightshift-storage";

const LEDGER_FILE: &str = "runs.jsonl";

/// Directory holding one log file per cycle plus the run ledger.
#[derive(Debug, Clone)]
pub struct RunLogStore {
    root: PathBuf,
}

impl RunLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn cycle_log_relative_path(&self, started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        let short = run_id.simple().to_string();
        PathBuf::from(format!("cycle_{stamp}_{}.log", &short[..8]))
    }

    /// Create a fresh log file for one cycle.
    ///
    /// The file is opened create-new, so an existing log is never reopened
    /// or truncated by a later cycle.
    pub async fn open_cycle_log(
        &self,
        started_at: DateTime<Utc>,
        run_id: Uuid,
    ) -> anyhow::Result<CycleLog> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating log directory {}", self.root.display()))?;

        let path = self
            .root
            .join(self.cycle_log_relative_path(started_at, run_id));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("creating cycle log {}", path.display()))?;

        Ok(CycleLog {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Append one finalized record to the ledger as a JSON line.
    pub async fn append_record(&self, record: &RunRecord) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating log directory {}", self.root.display()))?;

        let mut line = serde_json::to_vec(record).context("serializing run record")?;
        line.push(b'\n');

        let path = self.ledger_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening run ledger {}", path.display()))?;
        // a torn tail from an interrupted append must not swallow this record
        if ends_without_newline(&mut file)
            .await
            .with_context(|| format!("inspecting run ledger {}", path.display()))?
        {
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to run ledger {}", path.display()))?;
        file.sync_data()
            .await
            .with_context(|| format!("syncing run ledger {}", path.display()))?;
        Ok(())
    }

    /// Most recent `limit` records, oldest first. Unreadable lines are skipped.
    pub async fn recent_records(&self, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
        let path = self.ledger_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking run ledger {}", path.display()))?
        {
            return Ok(Vec::new());
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading run ledger {}", path.display()))?;
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(line = index + 1, error = %err, "skipping unreadable ledger line"),
            }
        }

        let skip = records.len().saturating_sub(limit.max(1));
        Ok(records.into_iter().skip(skip).collect())
    }
}

async fn ends_without_newline(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Append-only log of a single cycle, shared between the orchestrator's
/// phase markers and the job's captured output.
#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
    file: Arc<Mutex<fs::File>>,
}

impl CycleLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("writing cycle log {}", self.path.display()))?;
        file.write_all(b"\n")
            .await
            .with_context(|| format!("writing cycle log {}", self.path.display()))?;
        Ok(())
    }

    /// Timestamped orchestrator marker line.
    pub async fn mark(&self, message: &str) -> anyhow::Result<()> {
        self.append_line(&format!("# {} {message}", Utc::now().to_rfc3339()))
            .await
    }

    /// Flush and hash the log contents written so far.
    pub async fn seal(&self) -> anyhow::Result<String> {
        {
            let mut file = self.file.lock().await;
            file.flush()
                .await
                .with_context(|| format!("flushing cycle log {}", self.path.display()))?;
            file.sync_data()
                .await
                .with_context(|| format!("syncing cycle log {}", self.path.display()))?;
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading cycle log {}", self.path.display()))?;
        Ok(RunLogStore::sha256_hex(&bytes))
    }
}

/// Render recent ledger entries for operators.
pub fn history_markdown(records: &[RunRecord]) -> String {
    let mut lines = vec!["# Nightshift Run History".to_string(), String::new()];
    if records.is_empty() {
        lines.push("_no runs recorded yet_".to_string());
        return lines.join("\n");
    }

    for record in records.iter().rev() {
        let took = (record.finished_at - record.started_at).num_seconds();
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- outcome: **{}**", record.outcome));
        lines.push(format!("- trigger: {}", record.trigger_at.to_rfc3339()));
        lines.push(format!(
            "- started: {} ({took}s)",
            record.started_at.to_rfc3339()
        ));
        if let Some(code) = record.exit_code {
            lines.push(format!("- exit code: {code}"));
        }
        if let Some(signal) = record.exit_signal {
            lines.push(format!("- signal: {signal}"));
        }
        if let Some(detail) = &record.detail {
            lines.push(format!("- detail: {detail}"));
        }
        if record.stop_requested {
            lines.push("- stop requested during cycle".to_string());
        }
        lines.push(format!("- log: `{}`", record.log_path.display()));
        lines.push(String::new());
    }
    lines.join("\n")
}
