//! Shared application state handed to every request handler.

use std::sync::Arc;

use reqwest::Client;
use tokio_util::task::TaskTracker;

use crate::{
    backend::BackendClient,
    config::Config,
    metadata::MetadataStore,
    slots::SlotManager,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backends: Arc<Vec<Arc<BackendClient>>>,
    pub slot_manager: Arc<SlotManager>,
    pub metadata: MetadataStore,
    /// Tracks background work spawned off a request (the streaming
    /// persist-then-release task) so graceful shutdown can wait for it
    /// instead of exiting out from under it.
    pub task_tracker: TaskTracker,
}

impl AppState {
    pub async fn new(config: Config) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let metadata = MetadataStore::open(&config.meta_dir).await?;

        // One pooled HTTP client for the whole process, shared by every
        // backend instance, matching a production outbound client: bounded
        // idle-connection reuse plus connect/request timeouts.
        let http_client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()
            .expect("building the shared HTTP client cannot fail with these settings");

        let backends: Vec<Arc<BackendClient>> = config
            .backends
            .iter()
            .map(|b| Arc::new(BackendClient::new(http_client.clone(), b.url.clone())))
            .collect();

        let slot_pairs = backends
            .iter()
            .cloned()
            .zip(config.backends.iter().map(|b| b.n_slots))
            .collect();
        let slot_manager = Arc::new(SlotManager::new(slot_pairs, config.acquire_timeout));

        Ok(Self {
            config,
            backends: Arc::new(backends),
            slot_manager,
            metadata,
            task_tracker: TaskTracker::new(),
        })
    }

    /// The backend used for model-id discovery and as the canonical
    /// `model_id` source; multi-backend homogeneity is assumed (§4.5).
    pub fn primary_backend(&self) -> &Arc<BackendClient> {
        &self.backends[0]
    }
}
