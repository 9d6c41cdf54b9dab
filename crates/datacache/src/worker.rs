//! Background worker pool draining `pending_requests`.

use crate::fetch::Fetcher;
use crate::storage::{PendingRequest, RequestStatus, Storage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub max_concurrent_per_worker: usize,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            num_workers: 2,
            max_concurrent_per_worker: 3,
            batch_size: 10,
        }
    }
}

const BACKOFF_BASE: f64 = 1.0;
const BACKOFF_CAP: f64 = 30.0;

/// Owns the spawned worker tasks, their in-flight fetch tasks, a shared
/// shutdown flag, and the storage handle needed to reconcile state on exit.
pub struct WorkerManager {
    handles: Vec<JoinHandle<()>>,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown: Arc<AtomicBool>,
    storage: Arc<Storage>,
}

impl WorkerManager {
    /// Starts `config.num_workers` workers, each bounded by a semaphore of
    /// `config.max_concurrent_per_worker` concurrent fetches.
    pub fn start(storage: Arc<Storage>, fetcher: Arc<Fetcher>, config: WorkerConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let inflight = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let storage = storage.clone();
            let fetcher = fetcher.clone();
            let shutdown = shutdown.clone();
            let inflight = inflight.clone();
            let semaphore = Arc::new(Semaphore::new(config.max_concurrent_per_worker));
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, storage, fetcher, semaphore, shutdown, inflight).await;
            }));
        }
        WorkerManager {
            handles,
            inflight,
            shutdown,
            storage,
        }
    }

    /// Signals all workers to stop, aborts every spawned task -- both the
    /// claim loops and any in-flight `process_request` fetches -- and then
    /// flips any row `abort()` caught mid-fetch from `processing` to
    /// `failed` so a later run retries it. A request is never left stuck in
    /// `processing` after this returns.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            handle.abort();
        }
        let inflight = {
            let mut guard = self.inflight.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in inflight {
            handle.abort();
        }

        let storage = self.storage.clone();
        let result = tokio::task::spawn_blocking(move || storage.fail_processing_requests()).await;
        match result {
            Ok(Ok(n)) if n > 0 => warn!(count = n, "marked stuck requests failed on shutdown"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to reconcile processing requests on shutdown"),
            Err(e) => warn!(error = %e, "reconcile task panicked during shutdown"),
        }
    }
}

async fn run_worker(
    worker_id: usize,
    storage: Arc<Storage>,
    fetcher: Arc<Fetcher>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let empty_rounds = AtomicUsize::new(0);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let claim = {
            let storage = storage.clone();
            tokio::task::spawn_blocking(move || storage.get_next_request()).await
        };
        let claimed: Option<PendingRequest> = match claim {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!(worker_id, error = %e, "failed to claim next request");
                None
            }
            Err(e) => {
                warn!(worker_id, error = %e, "claim task panicked");
                None
            }
        };

        let Some(request) = claimed else {
            let rounds = empty_rounds.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = (BACKOFF_BASE * 2f64.powi((rounds - 1).min(4) as i32)).min(BACKOFF_CAP);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            continue;
        };
        empty_rounds.store(0, Ordering::SeqCst);

        let permit = semaphore.clone().acquire_owned().await;
        let storage = storage.clone();
        let fetcher = fetcher.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            process_request(worker_id, storage, fetcher, request).await;
        });
        let mut guard = inflight.lock().unwrap();
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }
}

async fn process_request(
    worker_id: usize,
    storage: Arc<Storage>,
    fetcher: Arc<Fetcher>,
    request: PendingRequest,
) {
    debug!(worker_id, request_id = %request.request_id, key = %request.request_key, "claimed request");

    if request.request_key != "fetch_url" {
        warn!(worker_id, key = %request.request_key, "unsupported request key");
        let _ = complete(&storage, &request.request_id, RequestStatus::Failed).await;
        return;
    }

    let Some(url) = request.params.get("url").and_then(|v| v.as_str()).map(str::to_string) else {
        warn!(worker_id, "fetch_url request missing url param");
        let _ = complete(&storage, &request.request_id, RequestStatus::Failed).await;
        return;
    };

    // Idempotence: if the URL was already cached since this request was
    // queued (e.g. duplicate queueing), skip the re-fetch.
    let storage_check = storage.clone();
    let url_check = url.clone();
    let already_cached = tokio::task::spawn_blocking(move || storage_check.retrieve_by_url(&url_check))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten()
        .is_some();
    if already_cached {
        let _ = complete(&storage, &request.request_id, RequestStatus::Completed).await;
        return;
    }

    let identifier = request.params.get("identifier").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let data_type = request.params.get("data_type").and_then(|v| v.as_str()).unwrap_or("generic").to_string();
    let provider = request.provider.clone();
    let ttl_seconds = request.params.get("ttl_seconds").and_then(|v| v.as_i64());
    let metadata = request.params.get("metadata").cloned();

    let result = fetcher
        .fetch_now(
            &url,
            &identifier,
            &data_type,
            &provider,
            Duration::from_secs(15),
            3,
            ttl_seconds,
            metadata,
        )
        .await;

    let status = match result {
        Ok(crate::fetch::FetchOutcome::Hit(_)) => RequestStatus::Completed,
        Ok(_) => RequestStatus::Failed,
        Err(e) => {
            warn!(worker_id, error = %e, %url, "fetch_url request failed");
            RequestStatus::Failed
        }
    };
    if let Err(e) = complete(&storage, &request.request_id, status).await {
        warn!(worker_id, error = %e, "failed to write terminal status");
    }
    info!(worker_id, request_id = %request.request_id, ?status, "request finished");
}

async fn complete(
    storage: &Arc<Storage>,
    request_id: &str,
    status: RequestStatus,
) -> crate::error::Result<()> {
    let storage = storage.clone();
    let request_id = request_id.to_string();
    tokio::task::spawn_blocking(move || storage.complete_request(&request_id, status))
        .await
        .map_err(|e| crate::error::Error::Timeout(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiterManager;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn request_status(db_path: &std::path::Path, request_id: &str) -> String {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.query_row(
            "SELECT status FROM pending_requests WHERE request_id = ?1",
            [request_id],
            |row| row.get(0),
        )
        .unwrap()
    }

    /// A request claimed by a worker that gets aborted mid-fetch must not
    /// stay stuck in `processing` -- `shutdown` has to reconcile it to
    /// `failed` so a later run retries it.
    #[tokio::test]
    async fn shutdown_fails_a_request_stuck_in_processing() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("datacache.sqlite");
        let storage = Arc::new(Storage::open(&db_path).unwrap());

        let params = serde_json::json!({
            "url": "http://example.invalid/x",
            "identifier": "id",
            "data_type": "generic",
        });
        storage
            .queue_request("musicbrainz", "fetch_url", &params, 5)
            .unwrap();

        // Simulate a worker that already claimed the request (flips it to
        // `processing`) and was then aborted before it could call
        // `complete_request`. No worker in this test ever touches it again.
        let claimed = storage
            .get_next_request()
            .unwrap()
            .expect("one pending request to claim");
        assert_eq!(request_status(&db_path, &claimed.request_id), "processing");

        let rate_limiters = Arc::new(RateLimiterManager::new(HashMap::new()));
        let fetcher = Arc::new(Fetcher::new(storage.clone(), rate_limiters));
        let manager = WorkerManager::start(
            storage.clone(),
            fetcher,
            WorkerConfig {
                num_workers: 1,
                max_concurrent_per_worker: 1,
                batch_size: 1,
            },
        );
        manager.shutdown().await;

        assert_eq!(request_status(&db_path, &claimed.request_id), "failed");
    }
}
