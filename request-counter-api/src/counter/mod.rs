use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use log::{debug, error, info, warn};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, interval_at},
};

use crate::store::{CounterStore, RequestLog, StoreError};

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub window: Duration,
    pub evict_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            evict_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(30),
        }
    }
}

struct Worker {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Counts requests over a trailing time window.
///
/// The service owns the request log exclusively; callers only see the
/// operations below. Cloning yields another handle onto the same counter.
#[derive(Clone)]
pub struct CounterService {
    requests: Arc<Mutex<RequestLog>>,
    store: Arc<Mutex<Box<dyn CounterStore>>>,
    config: CounterConfig,
    worker_started: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl CounterService {
    /// A load failure is not fatal: the counter starts over with an empty
    /// log and keeps serving from memory.
    pub fn new(mut store: Box<dyn CounterStore>, config: CounterConfig) -> Self {
        info!("Loading request log from store...");

        let requests = match store.load() {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Failed to load request log, starting empty, error: {e}");
                RequestLog::new()
            }
        };

        Self {
            requests: Arc::new(Mutex::new(requests)),
            store: Arc::new(Mutex::new(store)),
            config,
            worker_started: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn total_requests(&self) -> usize {
        self.lock_requests().len()
    }

    /// Records "now" and returns the new total, atomically with respect to
    /// concurrent reads, appends and eviction.
    pub fn new_request(&self) -> usize {
        let now = SystemTime::now();

        let mut requests = self.lock_requests();
        requests.push_back(now);
        let total = requests.len();
        drop(requests);

        debug!("New request recorded, total: {total}");

        total
    }

    /// Spawns the eviction/flush worker. Calling it again while the worker
    /// is running is a no-op.
    pub fn start(&self) {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Starting counter worker...");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service = self.clone();
        let handle = tokio::spawn(service.run_worker(shutdown_rx));

        *self.lock_worker() = Some(Worker {
            shutdown_tx,
            handle,
        });
    }

    /// Stops the worker and waits for it to exit, then unconditionally
    /// flushes the log and closes the store. Safe to call more than once;
    /// only the first call performs the worker handshake.
    pub async fn stop(&self) {
        if self.worker_started.swap(false, Ordering::SeqCst) {
            info!("Stopping counter worker...");

            let worker = self.lock_worker().take();
            if let Some(Worker {
                shutdown_tx,
                handle,
            }) = worker
            {
                let _ = shutdown_tx.send(());
                if let Err(e) = handle.await {
                    error!("Counter worker task failed, error: {e}");
                }
            }

            info!("Worker stopped");
        }

        if let Err(e) = self.flush() {
            error!("Failed to flush request log on shutdown, error: {e}");
        }

        if let Err(e) = self.lock_store().close() {
            error!("Failed to close counter store, error: {e}");
        }
    }

    async fn run_worker(self, mut shutdown_rx: oneshot::Receiver<()>) {
        // The first firing lands one full period after start.
        let mut evict_tick = interval_at(
            Instant::now() + self.config.evict_interval,
            self.config.evict_interval,
        );
        let mut flush_tick = interval_at(
            Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = evict_tick.tick() => self.evict_expired(),
                _ = flush_tick.tick() => {
                    if let Err(e) = self.flush() {
                        error!("Failed to flush request log, error: {e}");
                    }
                }
            }
        }
    }

    fn evict_expired(&self) {
        let Some(cutoff) = SystemTime::now().checked_sub(self.config.window) else {
            return;
        };

        let mut requests = self.lock_requests();
        if requests.is_empty() {
            return;
        }

        // Entries are FIFO ordered, so the walk stops at the first entry
        // still inside the window.
        while requests.front().is_some_and(|t| *t < cutoff) {
            requests.pop_front();
            debug!("Request expired, remaining: {}", requests.len());
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        debug!("Flushing request log to store...");

        // Copy under the log lock; the store I/O runs without it.
        let snapshot = self.lock_requests().clone();

        self.lock_store().save(&snapshot)
    }

    fn lock_requests(&self) -> MutexGuard<'_, RequestLog> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_store(&self) -> MutexGuard<'_, Box<dyn CounterStore>> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout};

    fn file_store(path: &Path) -> Box<dyn CounterStore> {
        Box::new(FileStore::open(path).expect("open counter file"))
    }

    fn test_config() -> CounterConfig {
        CounterConfig {
            window: Duration::from_secs(2),
            evict_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn it_starts_empty_with_fresh_file() {
        let tmp = tempdir().unwrap();

        let counter = CounterService::new(
            file_store(&tmp.path().join("counter.db")),
            CounterConfig::default(),
        );

        assert_eq!(counter.total_requests(), 0);
    }

    #[test]
    fn it_returns_next_value_for_each_request() {
        let tmp = tempdir().unwrap();

        let counter = CounterService::new(
            file_store(&tmp.path().join("counter.db")),
            CounterConfig::default(),
        );

        for expected in 1..=5 {
            assert_eq!(counter.new_request(), expected);
        }
        assert_eq!(counter.total_requests(), 5);
    }

    #[test]
    fn it_loads_persisted_requests() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("counter.db");

        let requests: RequestLog = (0..5).map(|_| SystemTime::now()).collect();
        let mut store = FileStore::open(&path).unwrap();
        store.save(&requests).unwrap();
        store.close().unwrap();

        let counter = CounterService::new(file_store(&path), CounterConfig::default());

        assert_eq!(counter.total_requests(), 5);
    }

    #[test]
    fn it_starts_empty_when_load_fails() {
        let counter = CounterService::new(Box::new(FailingStore), CounterConfig::default());

        assert_eq!(counter.total_requests(), 0);
        assert_eq!(counter.new_request(), 1);
    }

    #[tokio::test]
    async fn it_evicts_requests_outside_window() {
        let tmp = tempdir().unwrap();

        let counter = CounterService::new(
            file_store(&tmp.path().join("counter.db")),
            test_config(),
        );
        counter.start();

        counter.new_request();
        counter.new_request();
        assert_eq!(counter.total_requests(), 2);

        sleep(Duration::from_secs(1)).await;
        counter.new_request();
        assert_eq!(counter.total_requests(), 3);

        sleep(Duration::from_millis(1250)).await;
        assert_eq!(counter.total_requests(), 1);

        counter.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn it_counts_concurrent_requests() {
        let tmp = tempdir().unwrap();

        let counter = CounterService::new(
            file_store(&tmp.path().join("counter.db")),
            CounterConfig::default(),
        );

        let mut handles = Vec::with_capacity(1000);
        for _ in 0..1000 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                counter.total_requests();
                counter.new_request();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.total_requests(), 1000);
    }

    #[tokio::test]
    async fn it_stops_within_bound_and_persists_log() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("counter.db");

        let counter = CounterService::new(file_store(&path), test_config());
        counter.start();

        counter.new_request();
        counter.new_request();
        sleep(Duration::from_millis(500)).await;
        let expected = counter.total_requests();

        timeout(Duration::from_secs(3), counter.stop())
            .await
            .expect("worker took too long to stop");

        let mut reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap().len(), expected);
    }

    #[tokio::test]
    async fn it_ignores_repeated_start_and_stop() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("counter.db");

        let counter = CounterService::new(file_store(&path), test_config());
        counter.start();
        counter.start();

        counter.new_request();
        counter.stop().await;
        // Second stop skips the worker handshake and only re-runs the
        // flush-and-close portion, which fails against the closed store.
        counter.stop().await;

        assert_eq!(counter.total_requests(), 1);
    }

    #[tokio::test]
    async fn it_keeps_counting_when_store_fails() {
        let counter = CounterService::new(Box::new(FailingStore), test_config());
        counter.start();

        assert_eq!(counter.new_request(), 1);
        assert_eq!(counter.new_request(), 2);

        counter.stop().await;

        assert_eq!(counter.total_requests(), 2);
    }

    struct FailingStore;

    impl CounterStore for FailingStore {
        fn load(&mut self) -> Result<RequestLog, StoreError> {
            Err(StoreError::Read(std::io::Error::other("broken store")))
        }

        fn save(&mut self, _requests: &RequestLog) -> Result<(), StoreError> {
            Err(StoreError::Write(std::io::Error::other("broken store")))
        }

        fn close(&mut self) -> Result<(), StoreError> {
            Ok(())
        }
    }
}
