//! Per-stage pipeline state: the volume set, append-only secrets, and the
//! lazily constructed log-stream and TI clients.

use std::sync::{Arc, Mutex};

use stagehand_engine::spec::Volume;
use stagehand_logstream::{FileStore, LogClient, RemoteClient};
use stagehand_ti::{HttpTiClient, TiClient, TiConfig};

use crate::api::LogConfig;

/// Shared host volume mounted into every step container.
pub const SHARED_VOL_PATH: &str = "/tmp/engine";
pub const SHARED_VOL_NAME: &str = "_engine";

/// Base host path for per-stage TI data (callgraph, agent logs).
pub const TI_VOL_PATH: &str = "/tmp/ti";
pub const TI_VOL_NAME: &str = "_ti";

#[derive(Default)]
struct Inner {
    volumes: Vec<Volume>,
    secrets: Vec<String>,
    log_config: LogConfig,
    ti_config: TiConfig,
    network: String,
    log_client: Option<Arc<dyn LogClient>>,
    ti_client: Option<Arc<dyn TiClient>>,
}

/// Set exactly once at stage setup; step handlers may append secrets.
/// Getters hand out snapshots, never references into the guarded state.
#[derive(Default)]
pub struct PipelineState {
    inner: Mutex<Inner>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &self,
        volumes: Vec<Volume>,
        secrets: Vec<String>,
        log_config: LogConfig,
        ti_config: TiConfig,
        network: String,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.volumes = volumes;
        inner.secrets = secrets;
        inner.log_config = log_config;
        inner.ti_config = ti_config;
        inner.network = network;
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.inner.lock().unwrap().volumes.clone()
    }

    pub fn secrets(&self) -> Vec<String> {
        self.inner.lock().unwrap().secrets.clone()
    }

    pub fn append_secrets(&self, secrets: &[String]) {
        if secrets.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.secrets.extend(secrets.iter().cloned());
    }

    pub fn network(&self) -> String {
        self.inner.lock().unwrap().network.clone()
    }

    pub fn ti_config(&self) -> TiConfig {
        self.inner.lock().unwrap().ti_config.clone()
    }

    /// Whether log closes should upload a consolidated log.
    pub fn indirect_upload(&self) -> bool {
        self.inner.lock().unwrap().log_config.indirect_upload
    }

    /// Lazily constructed; with no log service configured the client writes
    /// into the shared volume for post-hoc fetch.
    pub fn log_client(&self) -> Arc<dyn LogClient> {
        let mut inner = self.inner.lock().unwrap();
        if inner.log_client.is_none() {
            let client: Arc<dyn LogClient> = if inner.log_config.url.is_empty() {
                Arc::new(FileStore::new(SHARED_VOL_PATH))
            } else {
                Arc::new(RemoteClient::new(
                    inner.log_config.url.clone(),
                    inner.log_config.account_id.clone(),
                    inner.log_config.token.clone(),
                    inner.log_config.indirect_upload,
                ))
            };
            inner.log_client = Some(client);
        }
        inner.log_client.as_ref().unwrap().clone()
    }

    pub fn ti_client(&self) -> Arc<dyn TiClient> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ti_client.is_none() {
            inner.ti_client = Some(Arc::new(HttpTiClient::new(inner.ti_config.clone())));
        }
        inner.ti_client.as_ref().unwrap().clone()
    }
}
