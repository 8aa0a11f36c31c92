//! Single-worker admission queue.
//!
//! At most one job runs at a time. While busy, up to `capacity` distinct jobs
//! wait in FIFO order; duplicates of the running or a waiting item are
//! refused. Admission checks and state transitions happen under one lock so
//! concurrent submissions cannot race past the capacity check.

use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::FutureExt;
use relay_job::{ItemId, Job};
use tokio::sync::watch;
use tracing::Instrument;

use crate::error::JobError;
use crate::support::format_error_chain;

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: Job) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The runner was idle; the job is executing now.
    Started,
    /// 1-based position among waiting jobs.
    Queued { position: usize },
    Duplicate,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub in_flight: Option<ItemId>,
    pub pending: Vec<ItemId>,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: usize,
    pending: VecDeque<Job>,
    in_flight: Option<ItemId>,
    next_seq: u64,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: VecDeque::new(),
            in_flight: None,
            next_seq: 1,
        }
    }

    /// Returns the admission outcome and, when idle, the job to start now.
    pub fn admit(&mut self, mut job: Job) -> (Admission, Option<Job>) {
        if let Some(current) = &self.in_flight {
            if *current == job.item_id || self.pending.iter().any(|j| j.item_id == job.item_id) {
                return (Admission::Duplicate, None);
            }
            if self.pending.len() >= self.capacity {
                return (Admission::Full, None);
            }
            job.seq = self.take_seq();
            self.pending.push_back(job);
            return (
                Admission::Queued {
                    position: self.pending.len(),
                },
                None,
            );
        }

        job.seq = self.take_seq();
        self.in_flight = Some(job.item_id.clone());
        (Admission::Started, Some(job))
    }

    /// Ends the in-flight job. Returns the next job, which is now in flight.
    pub fn finish(&mut self) -> Option<Job> {
        let next = self.pending.pop_front();
        self.in_flight = next.as_ref().map(|j| j.item_id.clone());
        next
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            in_flight: self.in_flight.clone(),
            pending: self.pending.iter().map(|j| j.item_id.clone()).collect(),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq
    }
}

struct RunnerInner {
    queue: Mutex<AdmissionQueue>,
    handler: Arc<dyn JobHandler>,
    busy_tx: watch::Sender<bool>,
    completed: AtomicU64,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(capacity: usize, handler: Arc<dyn JobHandler>) -> Self {
        let (busy_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunnerInner {
                queue: Mutex::new(AdmissionQueue::new(capacity)),
                handler,
                busy_tx,
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn submit(&self, job: Job) -> Admission {
        let item_id = job.item_id.clone();
        let (admission, start) = {
            let mut queue = self.lock_queue();
            let out = queue.admit(job);
            if out.1.is_some() {
                self.inner.busy_tx.send_replace(true);
            }
            out
        };

        tracing::info!(item_id = %item_id, ?admission, "job submitted");
        if let Some(job) = start {
            self.spawn_job(job);
        }
        admission
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lock_queue().snapshot()
    }

    /// Number of jobs that have passed through `complete()`.
    pub fn completed_count(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy_tx.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, AdmissionQueue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_job(&self, job: Job) {
        let runner = self.clone();
        let span = tracing::info_span!("job", item_id = %job.item_id, run_id = %job.run_id);
        tokio::spawn(
            async move {
                let item_id = job.item_id.clone();
                let handler = runner.inner.handler.clone();
                tracing::info!("job started");

                match AssertUnwindSafe(handler.run(job)).catch_unwind().await {
                    Ok(Ok(())) => tracing::info!("job finished"),
                    Ok(Err(err)) => {
                        let err = anyhow::Error::from(err);
                        tracing::error!(item_id = %item_id, error = %format_error_chain(&err), "job failed");
                    }
                    Err(_) => tracing::error!(item_id = %item_id, "job panicked"),
                }

                runner.complete();
            }
            .instrument(span),
        );
    }

    /// Runs exactly once per job, whatever the job's outcome.
    fn complete(&self) {
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut queue = self.lock_queue();
            let next = queue.finish();
            if next.is_none() {
                self.inner.busy_tx.send_replace(false);
            }
            next
        };

        if let Some(job) = next {
            tracing::info!(item_id = %job.item_id, seq = job.seq, "dequeued next job");
            self.spawn_job(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use relay_job::{JobOrigin, RegionCode};
    use tokio::sync::Semaphore;

    use super::*;

    fn job(id: &str) -> Job {
        Job::new(
            ItemId(id.to_string()),
            RegionCode::default(),
            JobOrigin {
                chat_id: 1,
                message_id: 1,
                reply_context: None,
                sender_id: None,
            },
        )
    }

    /// Blocks every job on a semaphore so tests decide when jobs finish.
    struct GatedHandler {
        gate: Semaphore,
        started: Mutex<Vec<(String, u64)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }

        fn started_ids(&self) -> Vec<String> {
            self.started
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for GatedHandler {
        async fn run(&self, job: Job) -> Result<(), JobError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.started
                .lock()
                .unwrap()
                .push((job.item_id.0.clone(), job.seq));

            self.gate.acquire().await.unwrap().forget();

            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MixedHandler {
        ran: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl JobHandler for MixedHandler {
        async fn run(&self, job: Job) -> Result<(), JobError> {
            self.ran.lock().unwrap().push(job.item_id.0.clone());
            match job.item_id.0.as_str() {
                "boom" => panic!("handler blew up"),
                "fail" => Err(JobError::RecordMissing {
                    item_id: job.item_id,
                }),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn queue_admits_idle_job_immediately() {
        let mut q = AdmissionQueue::new(5);
        let (adm, start) = q.admit(job("a"));
        assert_eq!(adm, Admission::Started);
        assert_eq!(start.map(|j| j.item_id.0), Some("a".to_string()));
        assert!(q.is_busy());
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn queue_finish_hands_over_in_fifo_order() {
        let mut q = AdmissionQueue::new(5);
        q.admit(job("a"));
        assert_eq!(q.admit(job("b")).0, Admission::Queued { position: 1 });
        assert_eq!(q.admit(job("c")).0, Admission::Queued { position: 2 });

        let b = q.finish().unwrap();
        assert_eq!(b.item_id.0, "b");
        assert_eq!(q.snapshot().in_flight, Some(ItemId("b".to_string())));
        let c = q.finish().unwrap();
        assert!(c.seq > b.seq);
        assert!(q.finish().is_none());
        assert!(!q.is_busy());
    }

    #[test]
    fn queue_rejects_duplicates_of_running_and_waiting() {
        let mut q = AdmissionQueue::new(5);
        q.admit(job("a"));
        assert_eq!(q.admit(job("a")).0, Admission::Duplicate);
        q.admit(job("b"));
        assert_eq!(q.admit(job("b")).0, Admission::Duplicate);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn queue_same_item_is_fine_after_it_finished() {
        let mut q = AdmissionQueue::new(5);
        q.admit(job("a"));
        assert!(q.finish().is_none());
        assert_eq!(q.admit(job("a")).0, Admission::Started);
    }

    #[test]
    fn queue_sixth_waiting_job_is_refused() {
        let mut q = AdmissionQueue::new(5);
        q.admit(job("running"));
        for i in 0..5 {
            let adm = q.admit(job(&format!("q{i}"))).0;
            assert_eq!(adm, Admission::Queued { position: i + 1 });
        }
        assert_eq!(q.admit(job("overflow")).0, Admission::Full);
        assert_eq!(q.pending_len(), 5);
    }

    #[tokio::test]
    async fn runner_runs_one_job_at_a_time_in_fifo_order() {
        let handler = GatedHandler::new();
        let runner = JobRunner::new(5, handler.clone());

        assert_eq!(runner.submit(job("a")), Admission::Started);
        assert_eq!(runner.submit(job("b")), Admission::Queued { position: 1 });
        assert_eq!(runner.submit(job("c")), Admission::Queued { position: 2 });

        handler.gate.add_permits(3);
        runner.wait_idle().await;

        assert_eq!(handler.started_ids(), vec!["a", "b", "c"]);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(runner.completed_count(), 3);
        assert_eq!(runner.snapshot().in_flight, None);
    }

    #[tokio::test]
    async fn runner_refuses_when_full_and_on_duplicates() {
        let handler = GatedHandler::new();
        let runner = JobRunner::new(5, handler.clone());

        runner.submit(job("a"));
        assert_eq!(runner.submit(job("a")), Admission::Duplicate);
        for i in 0..5 {
            runner.submit(job(&format!("q{i}")));
        }
        assert_eq!(runner.submit(job("q0")), Admission::Duplicate);
        assert_eq!(runner.submit(job("z")), Admission::Full);

        let snap = runner.snapshot();
        assert_eq!(snap.in_flight, Some(ItemId("a".to_string())));
        assert_eq!(snap.pending.len(), 5);

        handler.gate.add_permits(6);
        runner.wait_idle().await;
        assert_eq!(runner.completed_count(), 6);
        assert!(!handler.started_ids().contains(&"z".to_string()));
    }

    #[tokio::test]
    async fn runner_completes_failed_and_panicked_jobs() {
        let handler = Arc::new(MixedHandler {
            ran: Mutex::new(Vec::new()),
        });
        let runner = JobRunner::new(5, handler.clone());

        runner.submit(job("boom"));
        runner.submit(job("fail"));
        runner.submit(job("ok"));
        runner.wait_idle().await;

        assert_eq!(runner.completed_count(), 3);
        assert_eq!(*handler.ran.lock().unwrap(), vec!["boom", "fail", "ok"]);

        // Queue is usable again afterwards.
        assert_eq!(runner.submit(job("again")), Admission::Started);
        runner.wait_idle().await;
        assert_eq!(runner.completed_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_never_exceed_capacity() {
        let handler = GatedHandler::new();
        let runner = JobRunner::new(5, handler.clone());
        runner.submit(job("running"));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let runner = runner.clone();
            tasks.push(tokio::spawn(async move { runner.submit(job(&format!("j{i}"))) }));
        }
        let mut queued = 0;
        let mut full = 0;
        for t in tasks {
            match t.await.unwrap() {
                Admission::Queued { .. } => queued += 1,
                Admission::Full => full += 1,
                other => panic!("unexpected admission {other:?}"),
            }
        }
        assert_eq!(queued, 5);
        assert_eq!(full, 27);

        handler.gate.add_permits(6);
        runner.wait_idle().await;
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }
}
