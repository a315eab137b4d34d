//! Asynchronous job scheduler.
//!
//! Heavy work (archive building, batch export, post-store notification) runs
//! on a dedicated worker thread instead of the request path. Jobs are
//! executed FIFO; a job's failure is captured in its status, never thrown
//! back to the submitter. Job steps may call back into the orchestrator: the
//! core's locks are all acquired per call and released before the next, so a
//! job thread re-entering `Store`/`Read` takes no lock the request path is
//! still holding on its behalf.

use crate::{CoreError, CoreResult};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Opaque identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(String);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted job. Transitions are one-directional:
/// pending → running → succeeded | failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

/// A unit of deferred work.
pub trait Job: Send {
    /// Human-readable description, logged when the job starts and fails.
    fn description(&self) -> String;

    fn run(&mut self) -> CoreResult<()>;
}

struct Queued {
    id: JobId,
    job: Box<dyn Job>,
}

/// Upper bound on retained terminal statuses. Pending and running jobs are
/// always tracked; finished ones past this bound are swept oldest-first.
const TERMINAL_STATUS_RETENTION: usize = 1024;

#[derive(Default)]
struct StatusRegistry {
    statuses: HashMap<JobId, JobStatus>,
    /// Terminal job ids in completion order, oldest at the front.
    retired: VecDeque<JobId>,
}

impl StatusRegistry {
    fn record(&mut self, id: &JobId, status: JobStatus) {
        if status.is_terminal() {
            self.retired.push_back(id.clone());
        }
        self.statuses.insert(id.clone(), status);
        while self.retired.len() > TERMINAL_STATUS_RETENTION {
            match self.retired.pop_front() {
                Some(oldest) => {
                    self.statuses.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn forget(&mut self, id: &JobId) {
        self.statuses.remove(id);
    }
}

type SharedRegistry = Arc<Mutex<StatusRegistry>>;

/// FIFO scheduler backed by one worker thread.
pub struct Scheduler {
    registry: SharedRegistry,
    sender: Mutex<Option<mpsc::Sender<Queued>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the worker thread.
    pub fn start() -> Self {
        let registry: SharedRegistry = Arc::new(Mutex::new(StatusRegistry::default()));
        let (sender, receiver) = mpsc::channel::<Queued>();

        let worker_registry = registry.clone();
        let worker = std::thread::spawn(move || {
            for mut queued in receiver {
                record_status(&worker_registry, &queued.id, JobStatus::Running);
                tracing::info!("job {} started: {}", queued.id, queued.job.description());

                let outcome = queued.job.run();
                let status = match outcome {
                    Ok(()) => JobStatus::Succeeded,
                    Err(err) => {
                        tracing::error!(
                            "job {} failed ({}): {}",
                            queued.id,
                            queued.job.description(),
                            err
                        );
                        JobStatus::Failed {
                            message: err.to_string(),
                        }
                    }
                };
                record_status(&worker_registry, &queued.id, status);
            }
        });

        Self {
            registry,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a job and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if the scheduler has been shut down.
    pub fn submit(&self, job: Box<dyn Job>) -> CoreResult<JobId> {
        let id = JobId::new();

        let sender = self
            .sender
            .lock()
            .map_err(|_| CoreError::Internal("scheduler sender lock poisoned".into()))?;
        let sender = match sender.as_ref() {
            Some(sender) => sender,
            None => return Err(CoreError::Internal("scheduler is shut down".into())),
        };

        // The registry lock spans the enqueue, so the worker cannot pick the
        // job up before its pending status exists and a rejected enqueue
        // leaves no entry behind.
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.record(&id, JobStatus::Pending);
        if sender
            .send(Queued {
                id: id.clone(),
                job,
            })
            .is_err()
        {
            registry.forget(&id);
            return Err(CoreError::Internal("scheduler worker has stopped".into()));
        }
        Ok(id)
    }

    /// Returns the current status of a job, or `None` for an unknown id.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .statuses
            .get(id)
            .cloned()
    }

    #[cfg(test)]
    fn tracked_statuses(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .statuses
            .len()
    }

    /// Polls until the job reaches a terminal status or `timeout` elapses.
    /// Returns the last observed status.
    pub fn wait_for(&self, id: &JobId, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(id);
            match &status {
                Some(s) if s.is_terminal() => return status,
                _ if Instant::now() >= deadline => return status,
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Stops accepting jobs, drains the queue, and joins the worker.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    tracing::error!("scheduler worker panicked");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

fn record_status(registry: &SharedRegistry, id: &JobId, status: JobStatus) {
    registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .record(id, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingJob {
        label: usize,
        order: Arc<Mutex<Vec<usize>>>,
    }

    impl Job for RecordingJob {
        fn description(&self) -> String {
            format!("recording job {}", self.label)
        }

        fn run(&mut self) -> CoreResult<()> {
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct FailingJob;

    impl Job for FailingJob {
        fn description(&self) -> String {
            "failing job".into()
        }

        fn run(&mut self) -> CoreResult<()> {
            Err(CoreError::Internal("deliberate failure".into()))
        }
    }

    #[test]
    fn test_jobs_run_fifo() {
        let scheduler = Scheduler::start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last = None;
        for label in 0..5 {
            last = Some(
                scheduler
                    .submit(Box::new(RecordingJob {
                        label,
                        order: order.clone(),
                    }))
                    .unwrap(),
            );
        }
        let status = scheduler.wait_for(&last.unwrap(), Duration::from_secs(5));
        assert_eq!(status, Some(JobStatus::Succeeded));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failure_is_captured_in_status_not_propagated() {
        let scheduler = Scheduler::start();
        let id = scheduler.submit(Box::new(FailingJob)).unwrap();
        let status = scheduler.wait_for(&id, Duration::from_secs(5));
        assert!(matches!(status, Some(JobStatus::Failed { message }) if message.contains("deliberate")));
    }

    #[test]
    fn test_unknown_job_has_no_status() {
        let scheduler = Scheduler::start();
        let other = Scheduler::start();
        let id = other.submit(Box::new(FailingJob)).unwrap();
        other.wait_for(&id, Duration::from_secs(5));
        assert_eq!(scheduler.status(&id), None);
    }

    #[test]
    fn test_terminal_statuses_are_swept_past_retention() {
        struct NoopJob;
        impl Job for NoopJob {
            fn description(&self) -> String {
                "noop job".into()
            }
            fn run(&mut self) -> CoreResult<()> {
                Ok(())
            }
        }

        let scheduler = Scheduler::start();
        let first = scheduler.submit(Box::new(NoopJob)).unwrap();
        let mut last = first.clone();
        for _ in 0..TERMINAL_STATUS_RETENTION + 8 {
            last = scheduler.submit(Box::new(NoopJob)).unwrap();
        }

        let status = scheduler.wait_for(&last, Duration::from_secs(30));
        assert_eq!(status, Some(JobStatus::Succeeded));
        assert_eq!(scheduler.status(&first), None);
        assert!(scheduler.tracked_statuses() <= TERMINAL_STATUS_RETENTION);
    }

    #[test]
    fn test_rejected_submit_tracks_no_status() {
        let scheduler = Scheduler::start();
        scheduler.shutdown();

        assert!(scheduler.submit(Box::new(FailingJob)).is_err());
        assert_eq!(scheduler.tracked_statuses(), 0);
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_jobs() {
        let scheduler = Scheduler::start();
        let counter = Arc::new(AtomicUsize::new(0));

        struct CountingJob(Arc<AtomicUsize>);
        impl Job for CountingJob {
            fn description(&self) -> String {
                "counting job".into()
            }
            fn run(&mut self) -> CoreResult<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        for _ in 0..3 {
            scheduler
                .submit(Box::new(CountingJob(counter.clone())))
                .unwrap();
        }
        scheduler.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(scheduler.submit(Box::new(FailingJob)).is_err());
    }
}
