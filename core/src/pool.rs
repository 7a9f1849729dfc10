//! Warm pool of sandbox workers.
//!
//! A fixed-capacity collection of pre-warmed [`Executor`]s with
//! acquire/release semantics. Ownership encodes the idle/busy split: an
//! executor in the idle set is idle, one handed out by `acquire` is busy.
//! The idle set's mutex is the only shared mutable structure; pool state
//! rides in an atomic so `stop` is race-free against concurrent acquires.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::ExecutorError;
use crate::error::PoolError;
use crate::executor::Executor;

/// Creates fresh executors for the pool (and for one-off engine use).
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self) -> Result<Executor, ExecutorError>;
}

/// Spawns the sandbox worker binary.
#[derive(Debug, Clone)]
pub struct WorkerSpawner {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

#[async_trait]
impl ExecutorFactory for WorkerSpawner {
    async fn create(&self) -> Result<Executor, ExecutorError> {
        Executor::spawn(&self.program, &self.args).await
    }
}

struct PoolState;
impl PoolState {
    const RUNNING: u8 = 0;
    const STOPPED: u8 = 1;
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ExecutorFactory>,
    idle: Mutex<Vec<Executor>>,
    state: AtomicU8,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Pre-warm `config.size` executors and start the recycling task.
    pub async fn start(
        config: PoolConfig,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Result<Self, PoolError> {
        let mut idle = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            idle.push(factory.create().await?);
        }
        info!("worker pool warmed with {} executors", idle.len());

        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                idle: Mutex::new(idle),
                state: AtomicU8::new(PoolState::RUNNING),
                maintenance: Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(maintenance_loop(Arc::clone(&pool.inner)));
        *pool.inner.maintenance.lock().await = Some(handle);
        Ok(pool)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == PoolState::STOPPED
    }

    /// Hand out an idle executor, screening out any that died while
    /// pooled. Falls back to a cold spawn when the idle set is empty.
    pub async fn acquire(&self) -> Result<Executor, PoolError> {
        if self.is_stopped() {
            return Err(PoolError::Stopped);
        }
        loop {
            let candidate = { self.inner.idle.lock().await.pop() };
            match candidate {
                Some(mut executor) => {
                    if executor.is_alive() {
                        return Ok(executor);
                    }
                    debug!("discarding dead executor from the idle set");
                    executor.stop().await;
                }
                None => {
                    warn!("worker pool exhausted, spawning a cold executor");
                    return Ok(self.inner.factory.create().await?);
                }
            }
        }
    }

    /// Return an executor to the pool. Its namespace is reset first; if
    /// the reset fails the executor is discarded instead of re-pooled.
    /// Either way the release completes.
    pub async fn release(&self, mut executor: Executor) {
        if self.is_stopped() {
            executor.stop().await;
            return;
        }
        match executor.reset().await {
            Ok(()) => {
                self.inner.idle.lock().await.push(executor);
            }
            Err(err) => {
                warn!("discarding executor that failed to reset: {err}");
                executor.stop().await;
            }
        }
    }

    /// Stop the pool. Terminal: no further acquisitions succeed, and
    /// executors released afterwards are stopped rather than re-pooled.
    pub async fn stop(&self) {
        self.inner
            .state
            .store(PoolState::STOPPED, Ordering::SeqCst);
        if let Some(handle) = self.inner.maintenance.lock().await.take() {
            handle.abort();
        }
        let drained: Vec<Executor> = self.inner.idle.lock().await.drain(..).collect();
        for executor in drained {
            executor.stop().await;
        }
        info!("worker pool stopped");
    }

    /// Idle executors currently pooled.
    pub async fn idle_count(&self) -> usize {
        self.inner.idle.lock().await.len()
    }
}

/// Recycle idle executors older than the configured age, replacing each
/// with a fresh one so the pool stays warm.
async fn maintenance_loop(inner: Arc<PoolInner>) {
    loop {
        sleep(inner.config.maintenance_interval).await;
        if inner.state.load(Ordering::SeqCst) == PoolState::STOPPED {
            return;
        }

        let aged: Vec<Executor> = {
            let mut idle = inner.idle.lock().await;
            let mut kept = Vec::with_capacity(idle.len());
            let mut aged = Vec::new();
            for mut executor in idle.drain(..) {
                if executor.age() > inner.config.max_executor_age || !executor.is_alive() {
                    aged.push(executor);
                } else {
                    kept.push(executor);
                }
            }
            *idle = kept;
            aged
        };
        if aged.is_empty() {
            continue;
        }

        debug!("recycling {} aged executors", aged.len());
        let replacements = aged.len();
        for executor in aged {
            executor.stop().await;
        }
        // Replacements are spawned outside the lock so acquires are not
        // blocked behind process startup.
        for _ in 0..replacements {
            if inner.state.load(Ordering::SeqCst) == PoolState::STOPPED {
                return;
            }
            match inner.factory.create().await {
                Ok(executor) => inner.idle.lock().await.push(executor),
                Err(err) => warn!("failed to spawn replacement executor: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use delver_protocol::HostMessage;
    use delver_protocol::WorkerMessage;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::BufReader;

    use super::*;

    /// Factory producing executors wired to a minimal in-process worker
    /// task that acks resets and answers pings.
    struct LoopbackFactory {
        created: AtomicUsize,
    }

    impl LoopbackFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExecutorFactory for LoopbackFactory {
        async fn create(&self) -> Result<Executor, ExecutorError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
            let (host_read, host_write) = tokio::io::split(host_side);
            let (worker_read, mut worker_write) = tokio::io::split(worker_side);
            tokio::spawn(async move {
                let mut lines = BufReader::new(worker_read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(msg) = serde_json::from_str::<HostMessage>(&line) else {
                        continue;
                    };
                    let reply = match msg {
                        HostMessage::Reset | HostMessage::SetContext { .. } => WorkerMessage::Ack,
                        HostMessage::Ping => WorkerMessage::Pong,
                        _ => continue,
                    };
                    let mut out = serde_json::to_vec(&reply).unwrap();
                    out.push(b'\n');
                    if worker_write.write_all(&out).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Executor::with_streams(host_read, host_write))
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            size: 2,
            max_executor_age: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn pool_prewarms_to_size() {
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count().await, 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn acquire_and_release_cycle() {
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();

        let executor = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count().await, 1);
        pool.release(executor).await;
        assert_eq!(pool.idle_count().await, 2);
        // Release reset the namespace; no extra executors were created.
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn exhausted_pool_spawns_cold_executor() {
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        for executor in [a, b, c] {
            pool.release(executor).await;
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn acquire_after_stop_fails() {
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();
        pool.stop().await;
        assert!(matches!(pool.acquire().await, Err(PoolError::Stopped)));
    }

    #[tokio::test]
    async fn release_after_stop_discards_executor() {
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();
        let executor = pool.acquire().await.unwrap();
        pool.stop().await;
        pool.release(executor).await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn failed_reset_discards_instead_of_repooling() {
        // An executor whose worker is gone cannot be reset; release must
        // drop it rather than hand it to the next acquire.
        let factory = LoopbackFactory::new();
        let pool = WorkerPool::start(test_config(), Arc::clone(&factory) as _)
            .await
            .unwrap();

        let executor = pool.acquire().await.unwrap();
        // Sever the connection by dropping a fresh far end: simplest is
        // an executor built over a closed pipe.
        let (host_side, worker_side) = tokio::io::duplex(1024);
        drop(worker_side);
        let (host_read, host_write) = tokio::io::split(host_side);
        let broken = Executor::with_streams(host_read, host_write);
        executor.stop().await;

        pool.release(broken).await;
        assert_eq!(pool.idle_count().await, 1);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_recycles_aged_executors() {
        let factory = LoopbackFactory::new();
        let config = PoolConfig {
            size: 2,
            max_executor_age: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(30),
        };
        let pool = WorkerPool::start(config, Arc::clone(&factory) as _)
            .await
            .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        // Let one maintenance pass run well past the age limit.
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert_eq!(pool.idle_count().await, 2);
        pool.stop().await;
    }
}
