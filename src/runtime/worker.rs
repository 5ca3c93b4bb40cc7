//! runtime/worker.rs — the cooperative pipeline of in-flight executors on
//! one worker, plus its visibility-heartbeat and idle/wall-timeout tasks.

use crate::runtime::cache::LruCache;
use crate::runtime::config::WorkerConfig;
use crate::runtime::error::Result;
use crate::runtime::executor::Executor;
use crate::runtime::node_state::ProgramStatus;
use crate::runtime::program::{Collaborators, Program};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Process-local shared state for one worker's cooperative scheduler (spec
/// §5). Mutated only by tasks on this worker; never crosses a process
/// boundary.
#[derive(Default)]
pub struct SharedState {
    pub busy_workers: AtomicUsize,
    pub last_busy_time: AtomicI64,
    pub running_times: Mutex<Vec<Duration>>,
}

impl SharedState {
    fn mark_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// `elapsed_secs` is seconds since this worker's `run()` started —
    /// the same clock the idle check in `Worker::run` reads from, so the
    /// two stay comparable without either side touching wall-clock time.
    fn mark_idle(&self, elapsed_secs: i64) {
        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
        self.last_busy_time.store(elapsed_secs, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        self.busy_workers.load(Ordering::SeqCst) == 0
    }
}

pub struct Worker {
    program: Arc<Program>,
    collaborators: Collaborators,
    config: WorkerConfig,
    cache: Arc<Mutex<LruCache>>,
    shared: Arc<SharedState>,
}

impl Worker {
    pub fn new(program: Arc<Program>, collaborators: Collaborators, config: WorkerConfig) -> Self {
        let cache = Arc::new(Mutex::new(LruCache::new(config.cache_size)));
        Worker {
            program,
            collaborators,
            config,
            cache,
            shared: Arc::new(SharedState::default()),
        }
    }

    /// Drives the worker's cooperative pipeline of up to `pipeline_width`
    /// in-flight executors (spec §2, §5) until the idle timeout, the wall
    /// timeout, or the program leaving RUNNING, whichever is first.
    pub async fn run(&self) -> Result<()> {
        let wall_deadline = Instant::now() + self.config.wall_timeout();
        self.shared.last_busy_time.store(0, Ordering::SeqCst);
        let start = Instant::now();
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            if Instant::now() >= wall_deadline {
                info!("worker wall timeout reached, shutting down");
                break;
            }
            if self.shared.is_idle() {
                let idle_for = start.elapsed().as_secs() as i64
                    - self.shared.last_busy_time.load(Ordering::SeqCst);
                if idle_for >= self.config.idle_timeout_secs as i64 {
                    info!("idle timeout reached, shutting down");
                    break;
                }
            }
            match self.program.program_status(&self.collaborators).await? {
                ProgramStatus::Running | ProgramStatus::NotStarted => {}
                _ => {
                    info!("program left RUNNING, worker shutting down");
                    break;
                }
            }

            if in_flight.len() < self.config.pipeline_width {
                if let Some((priority, receipt, pc)) = self.poll_highest_priority().await? {
                    self.shared.mark_busy();
                    in_flight.spawn(self.spawn_execution(priority, receipt, pc, start));
                    continue;
                }
            }

            if in_flight.is_empty() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                tokio::select! {
                    _ = in_flight.join_next() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    /// Builds the future for one in-flight executor slot: heartbeat,
    /// execute, delete the queue message, record timing, and mark idle.
    /// `'static` so it can be handed to a `JoinSet` — every collaborator
    /// here is an `Arc` clone, matching the Open Question resolution that
    /// `Program` itself is shared metadata, not deep-copied per task
    /// (SPEC_FULL.md §9).
    fn spawn_execution(
        &self,
        priority: usize,
        receipt: String,
        pc: usize,
        worker_start: Instant,
    ) -> impl std::future::Future<Output = ()> + 'static {
        let program = self.program.clone();
        let collaborators = self.collaborators.clone();
        let config = self.config.clone();
        let cache = self.cache.clone();
        let shared = self.shared.clone();

        async move {
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let heartbeat = Self::spawn_heartbeat_for(&collaborators, &config, priority, receipt.clone(), stop.clone());

            let executor = Executor::new(&program, &collaborators, cache, &config);
            let exec_start = Instant::now();
            let outcome = executor.run(pc).await;
            stop.store(true, Ordering::SeqCst);
            heartbeat.abort();

            if let Err(e) = collaborators.queue.delete(priority, &receipt).await {
                warn!(error = %e, "failed to delete completed queue message");
            }

            shared.running_times.lock().await.push(exec_start.elapsed());
            shared.mark_idle(worker_start.elapsed().as_secs() as i64);

            if let Err(e) = outcome {
                warn!(error = %e, "executor run failed for this block");
            }
        }
    }

    async fn poll_highest_priority(&self) -> Result<Option<(usize, String, usize)>> {
        for priority in (0..=self.program.max_priority).rev() {
            if let Some(msg) = self
                .collaborators
                .queue
                .receive(priority, self.config.visibility_timeout())
                .await
                .map_err(|e| crate::runtime::error::RuntimeError::Queue(e.to_string()))?
            {
                let pc: usize = msg.body.parse().unwrap_or(usize::MAX);
                if pc == usize::MAX {
                    warn!(body = %msg.body, "queue message body was not a block index, dropping");
                    self.collaborators
                        .queue
                        .delete(priority, &msg.receipt_handle)
                        .await
                        .map_err(|e| crate::runtime::error::RuntimeError::Queue(e.to_string()))?;
                    continue;
                }
                return Ok(Some((priority, msg.receipt_handle, pc)));
            }
        }
        Ok(None)
    }

    fn spawn_heartbeat_for(
        collaborators: &Collaborators,
        config: &WorkerConfig,
        priority: usize,
        receipt: String,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = collaborators.queue.clone();
        let interval = config.heartbeat_interval();
        let visibility = config.visibility_timeout();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if queue.change_visibility(priority, &receipt, visibility).await.is_err() {
                    debug!("visibility heartbeat failed to renew, message may already be gone");
                    return;
                }
            }
        })
    }
}
