//! Named, restartable workers with a deferred-restart monitor

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type WorkerId = u64;

type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Factory for a worker's body. Restart re-invokes the factory, so the
/// closure must capture everything the worker needs to start over.
pub type WorkerFn = Arc<dyn Fn() -> WorkerFuture + Send + Sync>;

/// In-place retries before a returned worker body is handed to the monitor
const MAX_INLINE_RETRIES: u32 = 5;

/// How often the monitor drains the pending-restart queue
const RESTART_SCAN_INTERVAL: Duration = Duration::from_secs(2);

struct RestartRecord {
    name: String,
    factory: WorkerFn,
}

struct WorkerRecord {
    name: String,
    handle: JoinHandle<()>,
}

/// Spawns named workers and restarts the ones marked restartable.
///
/// A worker body returning is treated as abnormal: the trampoline re-invokes
/// it up to [`MAX_INLINE_RETRIES`] times, then (for restartable workers)
/// queues a restart record. A monitor task drains that queue every
/// [`RESTART_SCAN_INTERVAL`] and respawns. Respawning never happens on the
/// exiting task itself, so the exit path can never deadlock against the
/// spawn path. Worker ids change across restarts.
pub struct ThreadManager {
    self_ref: Weak<ThreadManager>,
    next_id: AtomicU64,
    workers: Arc<Mutex<HashMap<WorkerId, WorkerRecord>>>,
    restart_pending: Arc<Mutex<Vec<RestartRecord>>>,
    monitor_started: AtomicBool,
    shutting_down: Arc<AtomicBool>,
}

impl ThreadManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            next_id: AtomicU64::new(1),
            workers: Arc::new(Mutex::new(HashMap::new())),
            restart_pending: Arc::new(Mutex::new(Vec::new())),
            monitor_started: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn a named worker. With `restart = true` the worker is respawned
    /// by the monitor whenever its body finally returns.
    pub fn create_worker(&self, name: &str, restart: bool, factory: WorkerFn) -> WorkerId {
        self.ensure_monitor();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker_name = name.to_string();
        let workers = Arc::clone(&self.workers);
        let pending = Arc::clone(&self.restart_pending);
        let shutting_down = Arc::clone(&self.shutting_down);

        let trampoline_name = worker_name.clone();
        let trampoline_factory = Arc::clone(&factory);
        let handle = tokio::spawn(async move {
            for attempt in 0..=MAX_INLINE_RETRIES {
                trampoline_factory().await;
                if shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                if attempt < MAX_INLINE_RETRIES {
                    warn!(
                        "worker {} returned, retrying in place ({}/{})",
                        trampoline_name,
                        attempt + 1,
                        MAX_INLINE_RETRIES
                    );
                }
            }

            workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);

            if restart && !shutting_down.load(Ordering::Relaxed) {
                warn!(
                    "worker {} exhausted inline retries, deferring restart to the monitor",
                    trampoline_name
                );
                pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(RestartRecord { name: trampoline_name, factory: trampoline_factory });
            } else {
                debug!("worker {} ended", trampoline_name);
            }
        });

        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, WorkerRecord { name: worker_name, handle });
        id
    }

    /// Spawn `count` workers sharing one body factory.
    pub fn create_worker_pool(
        &self,
        count: usize,
        name: &str,
        restart: bool,
        factory: WorkerFn,
    ) -> Vec<WorkerId> {
        (0..count)
            .map(|i| self.create_worker(&format!("{name}-{i}"), restart, Arc::clone(&factory)))
            .collect()
    }

    /// Abort a worker. Returns false for ids that are no longer live.
    pub fn abort(&self, id: WorkerId) -> bool {
        let record = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match record {
            Some(record) => {
                debug!("aborting worker {}", record.name);
                record.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Wait for a worker to finish. Consumes the worker record.
    pub async fn join(&self, id: WorkerId) {
        let record = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(record) = record {
            let _ = record.handle.await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the monitor, drop pending restarts and abort every live worker.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.restart_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, record) in workers.drain() {
            record.handle.abort();
        }
    }

    /// Start the restart monitor on first use.
    fn ensure_monitor(&self) {
        if self.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.self_ref.clone();
        let shutting_down = Arc::clone(&self.shutting_down);
        tokio::spawn(async move {
            info!("worker restart monitor started");
            loop {
                tokio::time::sleep(RESTART_SCAN_INTERVAL).await;
                if shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                let Some(manager) = manager.upgrade() else { break };
                let drained: Vec<RestartRecord> = manager
                    .restart_pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .drain(..)
                    .collect();
                for record in drained {
                    info!("restarting worker {}", record.name);
                    manager.create_worker(&record.name, true, record.factory);
                }
            }
            debug!("worker restart monitor ended");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn worker_runs_and_is_tracked() {
        let manager = ThreadManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let id = manager.create_worker(
            "one-shot",
            false,
            Arc::new(move || {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    flag.store(true, Ordering::Relaxed);
                    // Park forever so the trampoline never retries
                    std::future::pending::<()>().await;
                })
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ran.load(Ordering::Relaxed));
        assert_eq!(manager.worker_count(), 1);
        assert!(manager.abort(id));
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn returned_body_is_retried_inline() {
        let manager = ThreadManager::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let id = manager.create_worker(
            "flappy",
            false,
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            }),
        );
        manager.join(id).await;
        assert_eq!(runs.load(Ordering::Relaxed), 1 + MAX_INLINE_RETRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn restartable_worker_is_respawned_by_monitor() {
        let manager = ThreadManager::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        manager.create_worker(
            "phoenix",
            true,
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            }),
        );
        // First spawn burns the inline retries, then the monitor picks the
        // record up on its next 2 s scan
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(runs.load(Ordering::Relaxed) > 1 + MAX_INLINE_RETRIES);
        manager.shutdown();
    }

    #[tokio::test]
    async fn pool_spawns_requested_count() {
        let manager = ThreadManager::new();
        let ids = manager.create_worker_pool(
            3,
            "pooled",
            false,
            Arc::new(|| Box::pin(std::future::pending::<()>())),
        );
        assert_eq!(ids.len(), 3);
        assert_eq!(manager.worker_count(), 3);
        manager.shutdown();
        assert_eq!(manager.worker_count(), 0);
    }
}
