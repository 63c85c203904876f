//! Routing of jobs onto the accelerated or general-purpose worker pool.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::arbiter::{LeaseGuard, ResourceArbiter, ResourceStatus};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::status::{self, DeviceClass, EphemeralStore, JobRecordStore, JobState, JobStatusRecord};
use crate::worker::{JobRequest, JobRunner, Task, Worker, WorkerSettings};

/// Returned by [`Dispatcher::route`]; the job itself runs asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteHandle {
    pub job_id: u64,
    pub task_id: String,
    pub class: DeviceClass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub resource: ResourceStatus,
    pub accelerated_queue_depth: usize,
    pub general_queue_depth: usize,
    pub accelerated_workers: usize,
    pub general_workers: usize,
}

pub struct Dispatcher {
    arbiter: Arc<ResourceArbiter>,
    durable: Arc<dyn JobRecordStore>,
    ephemeral: Arc<EphemeralStore>,
    accelerated_tx: Option<Sender<Task>>,
    general_tx: Option<Sender<Task>>,
    accelerated_workers: usize,
    general_workers: usize,
    handles: Vec<JoinHandle<()>>,
    seq: AtomicU64,
}

impl Dispatcher {
    /// Spawns both worker pools. Pool sizes and time limits come from `config`.
    pub fn start(
        config: &Config,
        arbiter: Arc<ResourceArbiter>,
        durable: Arc<dyn JobRecordStore>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let ephemeral = Arc::new(EphemeralStore::new(config.ephemeral_ttl()));
        let worker = Arc::new(Worker::new(
            WorkerSettings::from_config(config),
            Arc::clone(&arbiter),
            Arc::clone(&durable),
            Arc::clone(&ephemeral),
            runner,
        ));

        let (accelerated_tx, accelerated_rx) = unbounded::<Task>();
        let (general_tx, general_rx) = unbounded::<Task>();
        let accelerated_workers = config.accelerator_workers.max(1);
        let general_workers = config.general_workers.max(1);

        let mut handles = Vec::with_capacity(accelerated_workers + general_workers);
        for i in 0..accelerated_workers {
            handles.push(spawn_pool_worker(
                format!("gpu-worker-{}", i),
                accelerated_rx.clone(),
                Arc::clone(&worker),
            )?);
        }
        for i in 0..general_workers {
            handles.push(spawn_pool_worker(
                format!("cpu-worker-{}", i),
                general_rx.clone(),
                Arc::clone(&worker),
            )?);
        }
        info!(
            accelerated_workers,
            general_workers,
            accelerator_present = arbiter.present(),
            "dispatcher started"
        );

        Ok(Self {
            arbiter,
            durable,
            ephemeral,
            accelerated_tx: Some(accelerated_tx),
            general_tx: Some(general_tx),
            accelerated_workers,
            general_workers,
            handles,
            seq: AtomicU64::new(1),
        })
    }

    /// Queues `job_id` for processing. The accelerator is claimed here, in a
    /// single compare-and-set, and handed to the worker inside the task; a
    /// job that cannot claim it goes to the general pool. Jobs that are
    /// already queued, processing or completed are rejected.
    pub fn route(&self, job_id: u64, request: JobRequest) -> Result<RouteHandle> {
        let record = self.durable.get(job_id).ok_or(Error::JobNotFound(job_id))?;
        if !record.state.can_transition_to(JobState::Queued) {
            return Err(Error::InvalidJobState(job_id, record.state.as_str()));
        }

        let task_id = format!("task-{}-{}", job_id, self.seq.fetch_add(1, Ordering::SeqCst));
        let lease = LeaseGuard::acquire(&self.arbiter, &task_id);
        let class = if lease.is_some() {
            DeviceClass::Accelerated
        } else {
            DeviceClass::General
        };

        // A lost race on the record drops `lease` here, releasing it.
        self.durable.update(job_id, &mut |rec| {
            rec.transition(JobState::Queued)?;
            rec.device = Some(class);
            rec.task_id = Some(task_id.clone());
            rec.processed_frames = 0;
            rec.summary = None;
            rec.error_message = None;
            rec.processed_at = None;
            Ok(())
        })?;

        let task = Task {
            job_id,
            task_id: task_id.clone(),
            device: class,
            request,
            lease,
        };
        let queue = match class {
            DeviceClass::Accelerated => self.accelerated_tx.as_ref(),
            DeviceClass::General => self.general_tx.as_ref(),
        };
        let sent = match queue {
            Some(tx) => tx.send(task).map_err(|_| Error::QueueClosed),
            None => Err(Error::QueueClosed),
        };
        if let Err(e) = sent {
            let message = e.user_message();
            self.durable.update(job_id, &mut |rec| {
                rec.transition(JobState::Failed)?;
                rec.error_message = Some(message.clone());
                Ok(())
            })?;
            return Err(e);
        }

        info!(job = job_id, task = %task_id, device = class.as_str(), "job routed");
        Ok(RouteHandle {
            job_id,
            task_id,
            class,
        })
    }

    pub fn status(&self, job_id: u64) -> Result<JobStatusRecord> {
        status::query(self.durable.as_ref(), &self.ephemeral, job_id)
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            resource: self.arbiter.status(),
            accelerated_queue_depth: self.accelerated_tx.as_ref().map_or(0, |tx| tx.len()),
            general_queue_depth: self.general_tx.as_ref().map_or(0, |tx| tx.len()),
            accelerated_workers: self.accelerated_workers,
            general_workers: self.general_workers,
        }
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    pub fn store(&self) -> &Arc<dyn JobRecordStore> {
        &self.durable
    }

    /// Closes both queues and waits for queued jobs to drain.
    pub fn shutdown(&mut self) {
        self.accelerated_tx.take();
        self.general_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("pool worker exited with a panic");
            }
        }
        debug!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_pool_worker(name: String, rx: Receiver<Task>, worker: Arc<Worker>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        debug!(worker = %name, "pool worker started");
        while let Ok(task) = rx.recv() {
            // Outcome is already recorded in the status tiers.
            let _ = worker.execute(task);
        }
        debug!(worker = %name, "pool worker stopped");
    })?;
    Ok(handle)
}
