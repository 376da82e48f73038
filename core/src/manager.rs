use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::destination::{
    select_strategy, DestinationProvider, DirectFileProvider, SharedStorageProvider, Strategy,
};
use crate::error::{CoreError, CoreResult};
use crate::net::{HttpClient, ReqwestHttpClient, TransferRequest, TransferResponse};
use crate::registry::TaskRegistry;
use crate::storage::{MemoryStorageIndex, StorageIndex, VolumeLayout};
use crate::task::{TransferConfig, TransferId, TransferOutcome, TransferStatus};
use crate::transfer::TransferLoop;

/// Caller's side of a submitted transfer.
pub struct TransferHandle {
    id: TransferId,
    outcome: Receiver<TransferOutcome>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the transfer reaches a terminal state.
    pub fn wait(self) -> TransferOutcome {
        self.outcome.recv().unwrap_or_else(|_| {
            TransferOutcome::Failed(CoreError::InvalidState(
                "transfer worker exited without an outcome".to_string(),
            ))
        })
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransferOutcome> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(TransferOutcome::Failed(
                CoreError::InvalidState("transfer worker exited without an outcome".to_string()),
            )),
        }
    }

    pub fn try_outcome(&self) -> Option<TransferOutcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(TransferOutcome::Failed(
                CoreError::InvalidState("transfer worker exited without an outcome".to_string()),
            )),
        }
    }
}

pub struct TransferManager {
    pub config: EngineConfig,
    registry: Arc<TaskRegistry>,
    http: Arc<dyn HttpClient>,
    direct: Arc<dyn DestinationProvider>,
    shared: Arc<dyn DestinationProvider>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferManager {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let http = ReqwestHttpClient::new(&config.user_agent)?;
        let layout = VolumeLayout::new(
            config.shared_root.join("external"),
            config.shared_root.join("internal"),
        );
        let index: Arc<dyn StorageIndex> = Arc::new(MemoryStorageIndex::new(layout));
        Ok(Self {
            registry: Arc::new(TaskRegistry::new()),
            http: Arc::new(http),
            direct: Arc::new(DirectFileProvider::new(config.shared_root.clone())),
            shared: Arc::new(SharedStorageProvider::new(index, &config.platform)),
            handles: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn with_http_client(mut self, http: Box<dyn HttpClient>) -> Self {
        self.http = Arc::from(http);
        self
    }

    pub fn with_storage_index(mut self, index: Arc<dyn StorageIndex>) -> Self {
        self.shared = Arc::new(SharedStorageProvider::new(index, &self.config.platform));
        self
    }

    pub fn with_direct_provider(mut self, provider: Arc<dyn DestinationProvider>) -> Self {
        self.direct = provider;
        self
    }

    pub fn with_shared_provider(mut self, provider: Arc<dyn DestinationProvider>) -> Self {
        self.shared = provider;
        self
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    fn provider_for(&self, strategy: Strategy) -> Arc<dyn DestinationProvider> {
        match strategy {
            Strategy::DirectFile => Arc::clone(&self.direct),
            Strategy::SharedStorage => Arc::clone(&self.shared),
        }
    }

    /// Validate `config` and start streaming it on a worker thread.
    ///
    /// Configuration errors are returned here and nothing is registered.
    /// Everything after that is reported through the callbacks and the
    /// returned handle.
    pub fn submit(&self, config: TransferConfig) -> CoreResult<TransferHandle> {
        let id = config.id();
        if id.trim().is_empty() {
            return Err(CoreError::Config("transfer url is empty".to_string()));
        }
        let strategy = select_strategy(&config.destination, &self.config.platform);
        let provider = self.provider_for(strategy);
        provider.validate(&config.destination)?;

        self.registry.register(&id);
        log::debug!("submitting {} via {:?}", id, strategy);

        let mut request = TransferRequest::new(config.url.clone(), self.config.user_agent.clone());
        request.params = config.params.clone();

        let (tx, rx) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        let http = Arc::clone(&self.http);
        let chunk_size = self.config.chunk_size;
        let worker_id = id.clone();
        let spawned = thread::Builder::new()
            .name("xfer-worker".to_string())
            .spawn(move || {
                let outcome = match http.fetch(&request) {
                    Ok(response) => {
                        stream_response(&worker_id, &config, response, provider, &registry, chunk_size)
                    }
                    Err(err) => {
                        registry.clear(&worker_id);
                        log::error!("request for {} failed: {}", worker_id, err);
                        (config.callbacks.on_failure)(&err);
                        TransferOutcome::Failed(err)
                    }
                };
                let _ = tx.send(outcome);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.registry.clear(&id);
                return Err(CoreError::Io(err.to_string()));
            }
        };
        self.reap_handles();
        self.handles
            .lock()
            .map_err(|_| CoreError::InvalidState("handle lock poisoned".to_string()))?
            .push(handle);

        Ok(TransferHandle { id, outcome: rx })
    }

    pub fn pause(&self, id: &str, paused: bool) {
        self.registry.set_paused(id, paused);
    }

    pub fn resume(&self, id: &str) {
        self.pause(id, false);
    }

    pub fn cancel(&self, id: &str) {
        self.registry.set_cancelled(id);
    }

    pub fn pause_all(&self, paused: bool) {
        self.registry.pause_all(paused);
    }

    pub fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    /// `None` once the transfer has reached a terminal state.
    pub fn status(&self, id: &str) -> Option<TransferStatus> {
        self.registry.status(id)
    }

    pub fn active_transfers(&self) -> Vec<TransferId> {
        self.registry.active_ids()
    }

    pub fn wait_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }

    fn reap_handles(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            let mut index = 0usize;
            while index < handles.len() {
                if handles[index].is_finished() {
                    let handle = handles.remove(index);
                    let _ = handle.join();
                } else {
                    index += 1;
                }
            }
        }
    }
}

fn stream_response(
    id: &str,
    config: &TransferConfig,
    response: TransferResponse,
    provider: Arc<dyn DestinationProvider>,
    registry: &TaskRegistry,
    chunk_size: usize,
) -> TransferOutcome {
    let destination = &config.destination;
    TransferLoop::new(id, registry, &config.callbacks, chunk_size)
        .run(response, || provider.open(destination))
}
