#![forbid(unsafe_code)]

// Worker pool: fixed set of media workers, round-robin assignment, fail-fast on worker death

use crate::media::config::WorkerConfig;
use crate::media::types::{MediaError, MediaResult, WorkerDeath};
use crate::media::{MediaEngine, MediaWorker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Owns every media worker for the lifetime of the process.
///
/// Workers are never recreated. When one dies the pool logs it, waits
/// `death_grace`, then resolves [`WorkerPool::wait_fatal`] so the binary can exit.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next_worker_idx: AtomicUsize,
    engine_name: &'static str,
    fatal: watch::Receiver<Option<WorkerDeath>>,
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns all configured workers, one after another, before returning.
    ///
    /// # Errors
    /// Returns an error if `num_workers` is zero or any worker fails to start
    pub async fn start(engine: Arc<dyn MediaEngine>, config: &WorkerConfig) -> MediaResult<Self> {
        if config.num_workers == 0 {
            return Err(MediaError::ConfigurationError(
                "num_workers must be at least 1".to_string(),
            ));
        }

        info!(
            "Starting {} {} media workers (rtc ports {}-{})",
            config.num_workers,
            engine.name(),
            config.rtc_min_port,
            config.rtc_max_port
        );

        let (death_tx, death_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            let worker = engine.spawn_worker(index, config, death_tx.clone()).await?;
            info!("Created worker {} (pid {})", index, worker.pid());
            workers.push(worker);
        }
        drop(death_tx);

        let (fatal_tx, fatal_rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(death_rx, config.death_grace, fatal_tx));

        Ok(Self {
            workers,
            next_worker_idx: AtomicUsize::new(0),
            engine_name: engine.name(),
            fatal: fatal_rx,
            supervisor,
        })
    }

    /// Next worker in strict round-robin order. No load metric is consulted.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if the selected worker has died
    pub fn acquire_worker(&self) -> MediaResult<Arc<dyn MediaWorker>> {
        let len = self.workers.len();
        let idx = match self
            .next_worker_idx
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % len))
        {
            Ok(prev) | Err(prev) => prev,
        };

        let worker = &self.workers[idx];
        if !worker.is_alive() {
            return Err(MediaError::WorkerError(format!(
                "worker {} (pid {}) is dead",
                idx,
                worker.pid()
            )));
        }

        debug!("Selected worker {} (pid {})", idx, worker.pid());
        Ok(worker.clone())
    }

    /// Resolves once a worker has died and the grace delay has passed.
    /// Never resolves if no worker ever dies.
    pub async fn wait_fatal(&self) -> WorkerDeath {
        let mut rx = self.fatal.clone();
        if let Ok(death) = rx.wait_for(Option::is_some).await {
            if let Some(death) = death.clone() {
                return death;
            }
        }
        std::future::pending().await
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine_name
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.supervisor.abort();
        debug!("WorkerPool being dropped");
    }
}

async fn supervise(
    mut deaths: mpsc::UnboundedReceiver<WorkerDeath>,
    grace: Duration,
    fatal_tx: watch::Sender<Option<WorkerDeath>>,
) {
    if let Some(death) = deaths.recv().await {
        on_worker_failure(death, grace, &fatal_tx).await;
    }
}

/// A dead worker takes its routers with it, and rooms cannot be migrated,
/// so the whole process gives up after `grace`.
async fn on_worker_failure(
    death: WorkerDeath,
    grace: Duration,
    fatal_tx: &watch::Sender<Option<WorkerDeath>>,
) {
    error!(
        "Media worker {} died, exiting in {}ms... [pid:{}] reason: {}",
        death.index,
        grace.as_millis(),
        death.pid,
        death.reason
    );
    tokio::time::sleep(grace).await;
    let _ = fatal_tx.send(Some(death));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackEngine;

    fn config(num_workers: usize) -> WorkerConfig {
        WorkerConfig {
            num_workers,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = WorkerPool::start(engine, &config(2)).await.unwrap();

        let picks: Vec<usize> = (0..5)
            .map(|_| pool.acquire_worker().unwrap().index())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let engine = Arc::new(LoopbackEngine::new());
        let result = WorkerPool::start(engine, &config(0)).await;
        assert!(matches!(result, Err(MediaError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_dead_worker_not_handed_out() {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = WorkerPool::start(engine.clone(), &config(2)).await.unwrap();

        engine.worker(1).unwrap().kill("crash");
        assert_eq!(pool.alive_count(), 1);

        assert!(pool.acquire_worker().is_ok());
        assert!(matches!(pool.acquire_worker(), Err(MediaError::WorkerError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_is_fatal_after_grace() {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = WorkerPool::start(engine.clone(), &config(2)).await.unwrap();
        let started = tokio::time::Instant::now();

        engine.worker(0).unwrap().kill("segfault");

        let early = tokio::time::timeout(Duration::from_millis(1900), pool.wait_fatal()).await;
        assert!(early.is_err());

        let death = pool.wait_fatal().await;
        assert_eq!(death.index, 0);
        assert_eq!(death.reason, "segfault");
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
