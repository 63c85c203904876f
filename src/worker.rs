//! Job execution.
//!
//! A [`Worker`] runs one routed [`Task`] at a time: the analysis itself runs
//! on a dedicated job thread while the calling thread supervises it, renewing
//! the accelerator lease and enforcing the soft and hard time limits. The
//! task's [`LeaseGuard`] moves onto the job thread and is dropped exactly
//! once when that thread exits, whatever the outcome. A job abandoned at the
//! hard limit is asked to stop through its [`CancelFlag`] and keeps the
//! accelerator until it does, or until the lease expires unrenewed.

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::analysis::CancelFlag;
use crate::arbiter::{LeaseGuard, ResourceArbiter};
use crate::config::{processed_output_path, Config};
use crate::error::{Error, Result};
use crate::stats::SummaryStats;
use crate::status::{DeviceClass, EphemeralStore, JobRecord, JobRecordStore, JobState};

/// Per-submission processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub enable_speed_calculation: bool,
    pub speed_limit: f64,
}

impl JobRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            enable_speed_calculation: config.enable_speed_calculation,
            speed_limit: config.speed_limit,
        }
    }
}

impl Default for JobRequest {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub time_limit: Duration,
    pub soft_time_limit: Duration,
    pub renew_every: Duration,
    /// Frames between durable frame-counter writes.
    pub durable_every: u64,
    pub processed_dir: PathBuf,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_limit: config.task_time_limit(),
            soft_time_limit: config.task_soft_time_limit(),
            renew_every: config.lease_renew_interval(),
            durable_every: config.durable_every.max(1),
            processed_dir: config.processed_dir.clone(),
        }
    }

    fn output_path_for(&self, filename: &str) -> PathBuf {
        processed_output_path(&self.processed_dir, filename)
    }
}

/// Does the actual work for one job. Called on the job thread.
///
/// Implementations should check `cancel` between units of work and return
/// [`Error::Cancelled`] once it is raised.
pub trait JobRunner: Send + Sync + 'static {
    fn run(
        &self,
        job: &JobRecord,
        request: &JobRequest,
        device: DeviceClass,
        cancel: &CancelFlag,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<SummaryStats>;
}

/// A routed job waiting in a pool queue.
#[derive(Debug)]
pub struct Task {
    pub job_id: u64,
    pub task_id: String,
    pub device: DeviceClass,
    pub request: JobRequest,
    /// Held for accelerated tasks only.
    pub lease: Option<LeaseGuard>,
}

/// Forwards progress callbacks to both status tiers at their own cadences.
/// Durable writes are skipped once the job has left `Processing` under this
/// task id, so an abandoned job thread cannot overwrite a terminal record.
pub struct ProgressReporter {
    job_id: u64,
    task_id: String,
    device: DeviceClass,
    durable_every: u64,
    last_durable: u64,
    durable: Arc<dyn JobRecordStore>,
    ephemeral: Arc<EphemeralStore>,
}

impl ProgressReporter {
    pub fn new(
        job_id: u64,
        task_id: &str,
        device: DeviceClass,
        durable_every: u64,
        durable: Arc<dyn JobRecordStore>,
        ephemeral: Arc<EphemeralStore>,
    ) -> Self {
        Self {
            job_id,
            task_id: task_id.to_string(),
            device,
            durable_every: durable_every.max(1),
            last_durable: 0,
            durable,
            ephemeral,
        }
    }

    pub fn report(&mut self, processed: u64, total: u64) {
        let total = total.max(processed);
        if !self
            .ephemeral
            .update_progress(&self.task_id, processed, total, self.device)
        {
            debug!(task = %self.task_id, processed, "progress after terminal state ignored");
            return;
        }

        if processed < self.last_durable + self.durable_every {
            return;
        }
        self.last_durable = processed;
        let task_id = self.task_id.as_str();
        let result = self.durable.update(self.job_id, &mut |rec| {
            if rec.state == JobState::Processing && rec.task_id.as_deref() == Some(task_id) {
                rec.processed_frames = rec.processed_frames.max(processed);
                rec.total_frames = Some(rec.total_frames.unwrap_or(0).max(total));
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(job = self.job_id, error = %e, "durable progress write failed");
        }
    }
}

pub struct Worker {
    settings: WorkerSettings,
    arbiter: Arc<ResourceArbiter>,
    durable: Arc<dyn JobRecordStore>,
    ephemeral: Arc<EphemeralStore>,
    runner: Arc<dyn JobRunner>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        arbiter: Arc<ResourceArbiter>,
        durable: Arc<dyn JobRecordStore>,
        ephemeral: Arc<EphemeralStore>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            settings,
            arbiter,
            durable,
            ephemeral,
            runner,
        }
    }

    /// Runs `task` to a terminal state. The returned error is the job's
    /// failure, already recorded in both status tiers.
    pub fn execute(&self, task: Task) -> Result<SummaryStats> {
        let Task {
            job_id,
            task_id,
            device,
            request,
            mut lease,
        } = task;

        let record = match self.start(job_id, &task_id, device) {
            Ok(record) => record,
            Err(e) => {
                // Not ours to run; the record is left as it is.
                warn!(job = job_id, task = %task_id, error = %e, "task dropped");
                return Err(e);
            }
        };

        let outcome = if device == DeviceClass::Accelerated
            && (lease.is_none() || !self.arbiter.present())
        {
            Err(Error::AcceleratorUnavailable(format!(
                "task {} routed to the accelerated pool without a usable accelerator",
                task_id
            )))
        } else {
            self.ephemeral
                .begin(&task_id, device, record.total_frames.unwrap_or(0));
            self.supervise(&record, &task_id, device, request, lease.take())
        };

        self.finish(job_id, &task_id, device, &outcome);
        // Still held only when the job thread never started.
        drop(lease);
        outcome
    }

    fn start(&self, job_id: u64, task_id: &str, device: DeviceClass) -> Result<JobRecord> {
        let output = self.durable.get(job_id).map(|r| self.settings.output_path_for(&r.filename));
        self.durable.update(job_id, &mut |rec| {
            if rec.task_id.as_deref() != Some(task_id) {
                return Err(Error::InvalidJobState(rec.id, "reassigned"));
            }
            rec.transition(JobState::Processing)?;
            rec.device = Some(device);
            rec.processed_frames = 0;
            if rec.output_path.is_none() {
                rec.output_path = output.clone();
            }
            Ok(())
        })?;
        let record = self.durable.get(job_id).ok_or(Error::JobNotFound(job_id))?;
        info!(job = job_id, task = %task_id, device = device.as_str(), "job started");
        Ok(record)
    }

    fn supervise(
        &self,
        record: &JobRecord,
        task_id: &str,
        device: DeviceClass,
        request: JobRequest,
        lease: Option<LeaseGuard>,
    ) -> Result<SummaryStats> {
        let (tx, rx) = bounded(1);
        let runner = Arc::clone(&self.runner);
        let job = record.clone();
        let cancel = CancelFlag::new();
        let job_cancel = cancel.clone();
        let leased = lease.is_some();
        let mut reporter = ProgressReporter::new(
            record.id,
            task_id,
            device,
            self.settings.durable_every,
            Arc::clone(&self.durable),
            Arc::clone(&self.ephemeral),
        );

        thread::Builder::new()
            .name(format!("job-{}", record.id))
            .spawn(move || {
                let result = runner.run(&job, &request, device, &job_cancel, &mut |done, total| {
                    reporter.report(done, total)
                });
                drop(lease);
                // Receiver is gone when the job was abandoned on timeout.
                let _ = tx.send(result);
            })?;

        let started = Instant::now();
        let hard_at = started + self.settings.time_limit;
        let soft_at = started + self.settings.soft_time_limit;
        let mut renew_at = started + self.settings.renew_every;
        let mut warned = false;

        loop {
            let mut wake = hard_at.min(renew_at);
            if !warned {
                wake = wake.min(soft_at);
            }
            match rx.recv_timeout(wake.saturating_duration_since(Instant::now())) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::WorkerPanicked),
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if now >= hard_at {
                // The lease stays with the job thread and is no longer
                // renewed; it frees when the thread exits or expires.
                cancel.cancel();
                error!(
                    job = record.id,
                    task = %task_id,
                    limit_s = self.settings.time_limit.as_secs(),
                    "hard time limit exceeded, cancelling job"
                );
                return Err(Error::Timeout(self.settings.time_limit));
            }
            if !warned && now >= soft_at {
                warn!(
                    job = record.id,
                    task = %task_id,
                    limit_s = self.settings.soft_time_limit.as_secs(),
                    "soft time limit exceeded"
                );
                warned = true;
            }
            if now >= renew_at {
                if leased && !self.arbiter.renew(task_id) {
                    warn!(job = record.id, task = %task_id, "lease lost while job running");
                }
                renew_at = now + self.settings.renew_every;
            }
        }
    }

    /// Durable record first, so a poller that sees a terminal state can act
    /// on it (e.g. resubmit) without racing the store.
    fn finish(&self, job_id: u64, task_id: &str, device: DeviceClass, outcome: &Result<SummaryStats>) {
        match outcome {
            Ok(summary) => {
                let written = self.durable.update(job_id, &mut |rec| {
                    rec.transition(JobState::Completed)?;
                    rec.total_frames = Some(summary.total_frames);
                    rec.processed_frames = summary.processed_frames;
                    rec.summary = Some(summary.clone());
                    rec.error_message = None;
                    rec.processed_at = Some(Utc::now());
                    Ok(())
                });
                if let Err(e) = written {
                    error!(job = job_id, error = %e, "terminal status write failed");
                }
                self.ephemeral.mark_completed(task_id);
                info!(
                    job = job_id,
                    device = device.as_str(),
                    vehicles = summary.vehicle_count,
                    frames = summary.processed_frames,
                    avg_speed = ?summary.avg_speed,
                    "job completed"
                );
            }
            Err(e) => {
                let message = e.user_message();
                error!(job = job_id, device = device.as_str(), error = %e, "job failed");
                let written = self.durable.update(job_id, &mut |rec| {
                    rec.transition(JobState::Failed)?;
                    rec.error_message = Some(message.clone());
                    rec.processed_at = Some(Utc::now());
                    Ok(())
                });
                if let Err(e) = written {
                    error!(job = job_id, error = %e, "terminal status write failed");
                }
                self.ephemeral.mark_failed(task_id, device, &message);
            }
        }
    }
}

#[cfg(feature = "opencv")]
pub use self::cv::VideoJobRunner;

#[cfg(feature = "opencv")]
mod cv {
    use opencv::core::Mat;

    use super::{JobRequest, JobRunner};
    use crate::analysis::{process, AnalysisOptions, CancelFlag};
    use crate::calibration::CalibrationData;
    use crate::config::Config;
    use crate::detection::Tracker;
    use crate::error::Result;
    use crate::stats::SummaryStats;
    use crate::status::{DeviceClass, JobRecord};
    use crate::video::{FrameSource, VideoFileSink, VideoFileSource};

    type TrackerFactory =
        dyn Fn(&JobRecord, &JobRequest, DeviceClass) -> Result<Box<dyn Tracker<Mat>>> + Send + Sync;

    /// Decodes the job's input file, annotates it and writes the processed
    /// video next to the other outputs.
    pub struct VideoJobRunner {
        config: Config,
        tracker_factory: Box<TrackerFactory>,
    }

    impl VideoJobRunner {
        pub fn new<F>(config: Config, tracker_factory: F) -> Self
        where
            F: Fn(&JobRecord, &JobRequest, DeviceClass) -> Result<Box<dyn Tracker<Mat>>>
                + Send
                + Sync
                + 'static,
        {
            Self {
                config,
                tracker_factory: Box::new(tracker_factory),
            }
        }
    }

    impl JobRunner for VideoJobRunner {
        fn run(
            &self,
            job: &JobRecord,
            request: &JobRequest,
            device: DeviceClass,
            cancel: &CancelFlag,
            progress: &mut dyn FnMut(u64, u64),
        ) -> Result<SummaryStats> {
            let calibration = match &job.calibration {
                Some(value) => CalibrationData::from_value(value)?,
                None => None,
            };
            let mut source = VideoFileSource::open(&job.input_path)?;
            let output = job
                .output_path
                .clone()
                .unwrap_or_else(|| self.config.output_path_for(&job.filename));
            let mut sink = VideoFileSink::create(&output, &source.metadata())?;
            let mut tracker = (self.tracker_factory)(job, request, device)?;
            let options = AnalysisOptions::from_config(&self.config)
                .with_speed(request.enable_speed_calculation, request.speed_limit)
                .with_cancel(cancel.clone());

            process(
                &mut source,
                &mut sink,
                &mut tracker,
                calibration.as_ref(),
                &options,
                progress,
            )
        }
    }
}
