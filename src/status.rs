//! Job status protocol.
//!
//! Two tiers back every job: a durable [`JobRecord`] written only at state
//! transitions (plus a coarse frame counter), and an [`EphemeralRecord`]
//! keyed by task id that the running worker refreshes on every progress
//! callback. [`resolve`] merges them into the [`JobStatusRecord`] pollers see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::stats::SummaryStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Uploaded,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Uploaded => "uploaded",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Allowed edges of the job state machine. `Failed -> Queued` is a
    /// caller-initiated resubmission.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Uploaded, Queued)
                | (Failed, Queued)
                | (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

/// Worker class a job was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    #[serde(rename = "gpu")]
    Accelerated,
    #[serde(rename = "cpu")]
    General,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Accelerated => "gpu",
            DeviceClass::General => "cpu",
        }
    }
}

/// Durable per-job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub filename: String,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub state: JobState,
    pub total_frames: Option<u64>,
    pub processed_frames: u64,
    /// Raw calibration as stored; parsed by the worker.
    pub calibration: Option<serde_json::Value>,
    pub summary: Option<SummaryStats>,
    pub error_message: Option<String>,
    pub device: Option<DeviceClass>,
    pub task_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(filename: impl Into<String>, input_path: impl Into<PathBuf>) -> Self {
        Self {
            id: 0,
            filename: filename.into(),
            input_path: input_path.into(),
            output_path: None,
            state: JobState::Uploaded,
            total_frames: None,
            processed_frames: 0,
            calibration: None,
            summary: None,
            error_message: None,
            device: None,
            task_id: None,
            processed_at: None,
        }
    }

    pub fn with_calibration(mut self, calibration: serde_json::Value) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn with_total_frames(mut self, total: u64) -> Self {
        self.total_frames = Some(total);
        self
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidJobState(self.id, self.state.as_str()));
        }
        self.state = next;
        Ok(())
    }

    fn progress_percent(&self) -> u8 {
        match self.state {
            JobState::Completed => 100,
            JobState::Failed => 0,
            _ => percent(self.processed_frames, self.total_frames.unwrap_or(0)),
        }
    }
}

/// Durable store seam; owned outside the core.
pub trait JobRecordStore: Send + Sync {
    /// Inserts `record` under a fresh id and returns it.
    fn create(&self, record: JobRecord) -> u64;

    fn get(&self, id: u64) -> Option<JobRecord>;

    /// Applies `f` to the stored record under the store's lock.
    fn update(&self, id: u64, f: &mut dyn FnMut(&mut JobRecord) -> Result<()>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: Mutex<BTreeMap<u64, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, JobRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl JobRecordStore for InMemoryJobStore {
    fn create(&self, mut record: JobRecord) -> u64 {
        let mut records = self.lock();
        let id = records.keys().next_back().map_or(1, |last| last + 1);
        record.id = id;
        records.insert(id, record);
        id
    }

    fn get(&self, id: u64) -> Option<JobRecord> {
        self.lock().get(&id).cloned()
    }

    fn update(&self, id: u64, f: &mut dyn FnMut(&mut JobRecord) -> Result<()>) -> Result<()> {
        let mut records = self.lock();
        let record = records.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        // Apply to a copy so a rejected update leaves the row untouched.
        let mut draft = record.clone();
        f(&mut draft)?;
        *record = draft;
        Ok(())
    }
}

/// In-flight state written by the running worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralRecord {
    pub state: JobState,
    pub processed_frames: u64,
    pub total_frames: u64,
    pub device: DeviceClass,
    pub error_message: Option<String>,
    pub updated_at: Instant,
}

/// Fast, expiring tier keyed by task id.
#[derive(Debug)]
pub struct EphemeralStore {
    records: Mutex<HashMap<String, EphemeralRecord>>,
    ttl: Duration,
}

impl EphemeralStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EphemeralRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drops every record older than the TTL. Run on each write so tasks
    /// that are never polled again do not accumulate.
    fn purge(&self, records: &mut HashMap<String, EphemeralRecord>, now: Instant) {
        let before = records.len();
        records.retain(|_, r| now.duration_since(r.updated_at) < self.ttl);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "expired progress records purged");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn get(&self, task_id: &str) -> Option<EphemeralRecord> {
        self.get_at(task_id, Instant::now())
    }

    pub(crate) fn get_at(&self, task_id: &str, now: Instant) -> Option<EphemeralRecord> {
        let mut records = self.lock();
        match records.get(task_id) {
            Some(rec) if now.duration_since(rec.updated_at) < self.ttl => Some(rec.clone()),
            Some(_) => {
                records.remove(task_id);
                None
            }
            None => None,
        }
    }

    /// Worker picked the task up.
    pub fn begin(&self, task_id: &str, device: DeviceClass, total_frames: u64) {
        self.begin_at(task_id, device, total_frames, Instant::now())
    }

    pub(crate) fn begin_at(&self, task_id: &str, device: DeviceClass, total_frames: u64, now: Instant) {
        let mut records = self.lock();
        self.purge(&mut records, now);
        if records.get(task_id).is_some_and(|r| r.state.is_terminal()) {
            return;
        }
        records.insert(
            task_id.to_string(),
            EphemeralRecord {
                state: JobState::Processing,
                processed_frames: 0,
                total_frames,
                device,
                error_message: None,
                updated_at: now,
            },
        );
    }

    /// Progress is clamped to `total` and never moves backwards; updates
    /// after a terminal state are dropped. Returns whether it was applied.
    pub fn update_progress(&self, task_id: &str, processed: u64, total: u64, device: DeviceClass) -> bool {
        let mut records = self.lock();
        let now = Instant::now();
        self.purge(&mut records, now);
        let total = total.max(processed);
        match records.get_mut(task_id) {
            Some(rec) if rec.state.is_terminal() => false,
            Some(rec) => {
                rec.processed_frames = rec.processed_frames.max(processed);
                rec.total_frames = rec.total_frames.max(total);
                rec.device = device;
                rec.updated_at = now;
                true
            }
            None => {
                records.insert(
                    task_id.to_string(),
                    EphemeralRecord {
                        state: JobState::Processing,
                        processed_frames: processed,
                        total_frames: total,
                        device,
                        error_message: None,
                        updated_at: now,
                    },
                );
                true
            }
        }
    }

    /// Terminal tier-one failure so pollers see it without waiting for the
    /// durable write or expiry.
    pub fn mark_failed(&self, task_id: &str, device: DeviceClass, message: &str) {
        let mut records = self.lock();
        let now = Instant::now();
        self.purge(&mut records, now);
        let rec = records.entry(task_id.to_string()).or_insert_with(|| EphemeralRecord {
            state: JobState::Processing,
            processed_frames: 0,
            total_frames: 0,
            device,
            error_message: None,
            updated_at: now,
        });
        if rec.state.is_terminal() {
            return;
        }
        rec.state = JobState::Failed;
        rec.error_message = Some(message.to_string());
        rec.updated_at = now;
    }

    pub fn mark_completed(&self, task_id: &str) {
        if let Some(rec) = self.lock().get_mut(task_id) {
            if !rec.state.is_terminal() {
                rec.state = JobState::Completed;
                rec.processed_frames = rec.total_frames.max(rec.processed_frames);
                rec.updated_at = Instant::now();
            }
        }
    }
}

/// Wire record returned to status pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub id: u64,
    pub status: JobState,
    pub progress: u8,
    pub processed_frames: u64,
    pub total_frames: Option<u64>,
    pub device: Option<DeviceClass>,
    pub error_message: Option<String>,
    pub task_id: Option<String>,
}

fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (processed.min(total) * 100 / total) as u8
}

/// Merge rule. Ephemeral data wins while the durable state is live
/// (queued or processing); otherwise the durable record is authoritative.
/// A missing ephemeral record never implies failure.
pub fn resolve(durable: &JobRecord, ephemeral: Option<&EphemeralRecord>) -> JobStatusRecord {
    let live = matches!(durable.state, JobState::Queued | JobState::Processing);

    match ephemeral {
        Some(eph) if live => {
            let total = eph.total_frames.max(durable.total_frames.unwrap_or(0));
            let processed = eph.processed_frames.max(durable.processed_frames).min(total);
            let progress = match eph.state {
                JobState::Completed => 100,
                JobState::Failed => 0,
                _ => percent(processed, total),
            };
            JobStatusRecord {
                id: durable.id,
                status: eph.state,
                progress,
                processed_frames: processed,
                total_frames: Some(total),
                device: Some(eph.device),
                error_message: eph.error_message.clone(),
                task_id: durable.task_id.clone(),
            }
        }
        _ => JobStatusRecord {
            id: durable.id,
            status: durable.state,
            progress: durable.progress_percent(),
            processed_frames: match (durable.state, durable.total_frames) {
                (JobState::Completed, Some(total)) => total.max(durable.processed_frames),
                _ => durable.processed_frames,
            },
            total_frames: durable.total_frames,
            device: durable.device,
            error_message: durable.error_message.clone(),
            task_id: durable.task_id.clone(),
        },
    }
}

/// Resolves the status of `job_id` from both tiers.
pub fn query(
    durable: &dyn JobRecordStore,
    ephemeral: &EphemeralStore,
    job_id: u64,
) -> Result<JobStatusRecord> {
    let record = durable.get(job_id).ok_or(Error::JobNotFound(job_id))?;
    let eph = record.task_id.as_deref().and_then(|t| ephemeral.get(t));
    Ok(resolve(&record, eph.as_ref()))
}
