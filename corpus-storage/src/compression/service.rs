//! Compression service: request/response RPC over a background worker.
//!
//! Every call gets a fresh correlation id and an entry in the pending table.
//! A router task reads worker responses and completes the matching entry, so
//! concurrent calls are independent of completion order.
//!
//! # Degradation
//!
//! If the worker cannot be started, or exits with requests in flight, it is
//! recreated up to `max_restarts` times. After that the service switches to
//! inline mode and runs the codec on the calling task. A call never fails
//! just because the worker is gone; it can fail on timeout.

use std::io;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use corpus_core::{CompressionError, WorkerSettings};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{handle_request, serve, WorkerAction, WorkerRequest, WorkerResponse};

/// Result type for compression operations.
pub type CompressionResult<T> = Result<T, CompressionError>;

/// Configuration for the compression service.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// How long a caller waits for a worker response.
    pub request_timeout: Duration,
    /// How many times a failed worker is recreated before going inline.
    pub max_restarts: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_restarts: 1,
        }
    }
}

impl CompressionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }
}

impl From<&WorkerSettings> for CompressionConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            max_restarts: settings.max_restarts,
        }
    }
}

/// Starts a worker serving the given channels.
///
/// Implementations must answer every request they read with a response
/// carrying the same `id`, and drop `outbox` when they stop.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        inbox: mpsc::Receiver<WorkerRequest>,
        outbox: UnboundedSender<WorkerResponse>,
    ) -> io::Result<()>;
}

/// Runs the worker on a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        inbox: mpsc::Receiver<WorkerRequest>,
        outbox: UnboundedSender<WorkerResponse>,
    ) -> io::Result<()> {
        std::thread::Builder::new()
            .name("corpus-compression-worker".to_string())
            .spawn(move || serve(inbox, outbox))
            .map(|_| ())
    }
}

/// Where compression work currently runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// No worker started yet.
    Idle,
    /// A background worker is serving requests.
    Worker,
    /// The worker is unavailable; work runs on the calling task.
    Inline,
}

struct PendingRequest {
    generation: u64,
    completion: oneshot::Sender<WorkerResponse>,
}

#[derive(Default)]
struct WorkerSlot {
    sender: Option<mpsc::Sender<WorkerRequest>>,
    generation: u64,
    launches: u32,
    inline: bool,
}

/// Async compression API backed by a background worker.
pub struct CompressionService {
    config: CompressionConfig,
    spawner: Arc<dyn WorkerSpawner>,
    pending: Arc<DashMap<String, PendingRequest>>,
    slot: Mutex<WorkerSlot>,
}

impl CompressionService {
    /// Create a service whose worker runs on a dedicated thread.
    ///
    /// The worker is started lazily on the first call.
    pub fn new(config: CompressionConfig) -> Self {
        Self::with_spawner(config, Arc::new(ThreadSpawner))
    }

    pub fn with_spawner(config: CompressionConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config,
            spawner,
            pending: Arc::new(DashMap::new()),
            slot: Mutex::new(WorkerSlot::default()),
        }
    }

    /// Create a service that never starts a worker.
    pub fn inline(config: CompressionConfig) -> Self {
        let service = Self::new(config);
        service.lock_slot().inline = true;
        service
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress text.
    pub async fn compress(&self, text: &str) -> CompressionResult<String> {
        match self.dispatch(WorkerAction::Compress, text).await? {
            Some(payload) => Ok(payload),
            None => Err(CompressionError::Codec {
                reason: "compression produced no payload".to_string(),
            }),
        }
    }

    /// Decompress a payload; `Ok(None)` means the payload is corrupt or foreign.
    pub async fn decompress(&self, payload: &str) -> CompressionResult<Option<String>> {
        self.dispatch(WorkerAction::Decompress, payload).await
    }

    pub fn mode(&self) -> WorkerMode {
        let slot = self.lock_slot();
        if slot.inline {
            WorkerMode::Inline
        } else if slot.sender.is_some() {
            WorkerMode::Worker
        } else {
            WorkerMode::Idle
        }
    }

    /// Number of requests awaiting a worker response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of worker start attempts so far.
    pub fn launches(&self) -> u32 {
        self.lock_slot().launches
    }

    /// Stop the worker. Later calls run inline.
    pub fn shutdown(&self) {
        let mut slot = self.lock_slot();
        slot.sender = None;
        slot.inline = true;
        info!("Compression service shut down");
    }

    async fn dispatch(
        &self,
        action: WorkerAction,
        data: &str,
    ) -> CompressionResult<Option<String>> {
        loop {
            let Some((generation, sender)) = self.ensure_worker() else {
                return Ok(run_inline(action, data));
            };

            let id = Uuid::now_v7().to_string();
            let (completion, response) = oneshot::channel();
            self.pending.insert(
                id.clone(),
                PendingRequest {
                    generation,
                    completion,
                },
            );

            let request = WorkerRequest {
                action,
                data: data.to_string(),
                id: id.clone(),
            };
            if sender.send(request).is_err() {
                self.pending.remove(&id);
                self.worker_failed(generation, "request channel closed");
                continue;
            }

            match tokio::time::timeout(self.config.request_timeout, response).await {
                Ok(Ok(response)) => return into_result(response),
                Ok(Err(_)) => {
                    self.worker_failed(generation, "worker exited with request in flight");
                }
                Err(_) => {
                    self.pending.remove(&id);
                    let timeout_ms = self.config.request_timeout.as_millis() as u64;
                    warn!(id = %id, action = action.as_str(), timeout_ms, "Worker request timed out");
                    // A worker that stops answering counts against the restart budget.
                    self.worker_failed(generation, "request timed out");
                    return Err(CompressionError::Timeout { id, timeout_ms });
                }
            }
        }
    }

    /// Return the live worker, starting or restarting it if allowed.
    fn ensure_worker(&self) -> Option<(u64, mpsc::Sender<WorkerRequest>)> {
        let mut slot = self.lock_slot();
        loop {
            if slot.inline {
                return None;
            }
            if let Some(sender) = &slot.sender {
                return Some((slot.generation, sender.clone()));
            }
            if slot.launches > self.config.max_restarts {
                slot.inline = true;
                warn!(
                    launches = slot.launches,
                    "Compression worker unavailable, falling back to inline compression"
                );
                return None;
            }

            slot.launches += 1;
            slot.generation += 1;
            match self.launch(slot.generation) {
                Ok(sender) => {
                    info!(
                        generation = slot.generation,
                        launches = slot.launches,
                        "Compression worker started"
                    );
                    slot.sender = Some(sender.clone());
                    return Some((slot.generation, sender));
                }
                Err(e) => {
                    warn!(error = %e, launches = slot.launches, "Failed to start compression worker");
                }
            }
        }
    }

    fn launch(&self, generation: u64) -> CompressionResult<mpsc::Sender<WorkerRequest>> {
        let handle = Handle::try_current().map_err(|e| CompressionError::WorkerUnavailable {
            reason: e.to_string(),
        })?;

        let (request_tx, request_rx) = mpsc::channel();
        let (response_tx, response_rx) = unbounded_channel();
        self.spawner
            .spawn(request_rx, response_tx)
            .map_err(|e| CompressionError::WorkerUnavailable {
                reason: e.to_string(),
            })?;

        handle.spawn(route_responses(
            response_rx,
            Arc::clone(&self.pending),
            generation,
        ));
        Ok(request_tx)
    }

    fn worker_failed(&self, generation: u64, reason: &str) {
        let mut slot = self.lock_slot();
        if slot.generation == generation && slot.sender.is_some() {
            slot.sender = None;
            warn!(generation, reason, "Compression worker failed");
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CompressionService {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

impl std::fmt::Debug for CompressionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionService")
            .field("config", &self.config)
            .field("mode", &self.mode())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Complete pending requests as responses arrive, in any order.
async fn route_responses(
    mut responses: UnboundedReceiver<WorkerResponse>,
    pending: Arc<DashMap<String, PendingRequest>>,
    generation: u64,
) {
    while let Some(response) = responses.recv().await {
        match pending.remove(&response.id) {
            Some((_, request)) => {
                let _ = request.completion.send(response);
            }
            None => debug!(id = %response.id, "Dropping response with no pending request"),
        }
    }

    // The worker is gone; release whatever it still owed.
    pending.retain(|_, request| request.generation != generation);
    debug!(generation, "Compression worker response channel closed");
}

fn into_result(response: WorkerResponse) -> CompressionResult<Option<String>> {
    match response.error {
        Some(message) => Err(CompressionError::Worker {
            id: response.id,
            message,
        }),
        None => Ok(response.result),
    }
}

fn run_inline(action: WorkerAction, data: &str) -> Option<String> {
    handle_request(&WorkerRequest {
        action,
        data: data.to_string(),
        id: "inline".to_string(),
    })
    .result
}
