//! Core domain model, daily trigger clock and quality scoring for Nightshift.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nightshift-core";

/// Number of fields counted by the completeness score.
pub const QUALITY_FIELD_COUNT: u8 = 11;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger time {hour:02}:{minute:02} is out of range")]
    OutOfRange { hour: u32, minute: u32 },
    #[error("cannot parse trigger time `{0}` (expected HH:MM)")]
    BadTime(String),
    #[error("cannot parse utc offset `{0}` (expected +HH:MM, -HH:MM or UTC)")]
    BadOffset(String),
}

/// A wall-clock time of day pinned to a fixed UTC offset.
///
/// The offset never follows the host timezone and has no daylight-saving
/// transitions, so every day has exactly one trigger instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    time: NaiveTime,
    offset: FixedOffset,
}

impl DailyTrigger {
    pub fn new(hour: u32, minute: u32, offset: FixedOffset) -> Result<Self, TriggerError> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or(TriggerError::OutOfRange { hour, minute })?;
        Ok(Self { time, offset })
    }

    /// Parse `"HH:MM"` plus an offset such as `"+07:00"`.
    pub fn parse(time_of_day: &str, offset: &str) -> Result<Self, TriggerError> {
        let (h, m) = time_of_day
            .trim()
            .split_once(':')
            .ok_or_else(|| TriggerError::BadTime(time_of_day.to_string()))?;
        let hour = h
            .parse::<u32>()
            .map_err(|_| TriggerError::BadTime(time_of_day.to_string()))?;
        let minute = m
            .parse::<u32>()
            .map_err(|_| TriggerError::BadTime(time_of_day.to_string()))?;
        Self::new(hour, minute, parse_utc_offset(offset)?)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// The trigger instant on the given local calendar date.
    pub fn instant_on(&self, local_date: NaiveDate) -> DateTime<Utc> {
        let local = local_date.and_time(self.time);
        let utc = local - chrono::Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    /// Next trigger instant strictly after `now`.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.instant_on(now.with_timezone(&self.offset).date_naive());
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }

    /// Today's trigger instant when `now` falls inside the trigger minute.
    pub fn current_window(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = self.instant_on(now.with_timezone(&self.offset).date_naive());
        if now >= today && now < today + chrono::Duration::minutes(1) {
            Some(today)
        } else {
            None
        }
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }
}

impl fmt::Display for DailyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time.format("%H:%M"), self.offset)
    }
}

/// Contract form of [`DailyTrigger::next_due`].
pub fn next_due(
    now: DateTime<Utc>,
    hour: u32,
    minute: u32,
    tz: FixedOffset,
) -> Result<DateTime<Utc>, TriggerError> {
    Ok(DailyTrigger::new(hour, minute, tz)?.next_due(now))
}

pub fn parse_utc_offset(input: &str) -> Result<FixedOffset, TriggerError> {
    let bad = || TriggerError::BadOffset(input.to_string());
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(bad);
    }

    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(bad());
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours = h.parse::<i32>().map_err(|_| bad())?;
    let minutes = m.parse::<i32>().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// In-memory schedule position. Rebuilt from the wall clock on every start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub trigger: DailyTrigger,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_trigger_at: DateTime<Utc>,
}

impl ScheduleState {
    /// Derive the schedule for a process starting at `now`.
    ///
    /// Starting inside the trigger minute makes that minute due right away.
    pub fn at_startup(trigger: DailyTrigger, now: DateTime<Utc>) -> Self {
        let next_trigger_at = trigger
            .current_window(now)
            .unwrap_or_else(|| trigger.next_due(now));
        Self {
            trigger,
            last_run_at: None,
            next_trigger_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_trigger_at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.next_trigger_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Consume the current trigger after a completed or skipped cycle.
    pub fn complete(&mut self, finished_at: DateTime<Utc>) {
        self.last_run_at = Some(finished_at);
        self.next_trigger_at = self.trigger.next_due(finished_at.max(self.next_trigger_at));
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock advanced by hand, for simulations and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    TimedOut,
    EnvironmentError,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::EnvironmentError => "environment_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finalized record of one cycle, as appended to the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub trigger_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub log_path: PathBuf,
    pub log_sha256: Option<String>,
    pub detail: Option<String>,
    #[serde(default)]
    pub stop_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Automated,
    Interactive,
}

/// External job process invocation: program, arguments, working directory
/// and the environment handed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Split a whitespace separated command line into program and args.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(ToString::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            working_dir: None,
            env: BTreeMap::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_run_mode(self, mode: RunMode) -> Self {
        let flag = match mode {
            RunMode::Automated => "true",
            RunMode::Interactive => "false",
        };
        self.env("AUTOMATION_MODE", flag)
    }

    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A scraped job posting as handed over by the job process.
///
/// `source_url` is the natural identity used for idempotent upserts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobListing {
    pub source_url: String,
    pub ref_nr: Option<String>,
    pub profession: Option<String>,
    pub salary: Option<String>,
    pub company_name: Option<String>,
    pub location: Option<String>,
    pub start_date: Option<String>,
    pub telephone: Option<String>,
    pub email: Option<String>,
    pub job_description: Option<String>,
    pub external_link: Option<String>,
    pub application_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPolicy {
    /// Minimum trimmed character count for a description to count as present.
    pub min_description_len: usize,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            min_description_len: 50,
        }
    }
}

/// One presence flag per scored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldPresence {
    pub has_profession: bool,
    pub has_salary: bool,
    pub has_company_name: bool,
    pub has_location: bool,
    pub has_start_date: bool,
    pub has_telephone: bool,
    pub has_email: bool,
    pub has_job_description: bool,
    pub has_ref_nr: bool,
    pub has_external_link: bool,
    pub has_application_link: bool,
}

impl FieldPresence {
    pub fn assess(listing: &JobListing, policy: &QualityPolicy) -> Self {
        Self {
            has_profession: present(&listing.profession),
            has_salary: present(&listing.salary),
            has_company_name: present(&listing.company_name),
            has_location: present(&listing.location),
            has_start_date: present(&listing.start_date),
            has_telephone: present(&listing.telephone),
            has_email: present(&listing.email),
            has_job_description: listing
                .job_description
                .as_deref()
                .map(|d| d.trim().chars().count() >= policy.min_description_len.max(1))
                .unwrap_or(false),
            has_ref_nr: present(&listing.ref_nr),
            has_external_link: present(&listing.external_link),
            has_application_link: present(&listing.application_link),
        }
    }

    pub fn flags(&self) -> [bool; QUALITY_FIELD_COUNT as usize] {
        [
            self.has_profession,
            self.has_salary,
            self.has_company_name,
            self.has_location,
            self.has_start_date,
            self.has_telephone,
            self.has_email,
            self.has_job_description,
            self.has_ref_nr,
            self.has_external_link,
            self.has_application_link,
        ]
    }

    pub fn raw_score(&self) -> u8 {
        self.flags().iter().filter(|f| **f).count() as u8
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Pre-commit phase: the raw score depends only on the listing's own fields.
pub fn raw_quality_score(listing: &JobListing, policy: &QualityPolicy) -> u8 {
    FieldPresence::assess(listing, policy).raw_score()
}

pub fn normalized_score(raw: u8) -> f64 {
    f64::from(raw.min(QUALITY_FIELD_COUNT)) / f64::from(QUALITY_FIELD_COUNT)
}

/// Derived completeness metrics for one committed listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub listing_id: Uuid,
    pub presence: FieldPresence,
    pub raw_score: u8,
    pub completeness_score: f64,
    pub computed_at: DateTime<Utc>,
}

impl QualityMetrics {
    /// Post-commit phase computation, keyed by the listing's identity.
    pub fn derive(
        listing_id: Uuid,
        listing: &JobListing,
        policy: &QualityPolicy,
        computed_at: DateTime<Utc>,
    ) -> Self {
        let presence = FieldPresence::assess(listing, policy);
        let raw_score = presence.raw_score();
        Self {
            listing_id,
            presence,
            raw_score,
            completeness_score: normalized_score(raw_score),
            computed_at,
        }
    }
}
