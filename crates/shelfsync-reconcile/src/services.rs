//! Process-wide service registry, built once at startup.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use shelfsync_core::{AppConfig, BlobBackend, Database};
use tracing::{info, warn};

use crate::blob::{BlobStore, LocalBlobStore, MemoryBlobStore, SupabaseBlobStore};
use crate::channel::{ExportChannel, SourceChannel, disconnect_within};
use crate::error::{ReconcileError, Result};
use crate::orchestrator::Orchestrator;
use crate::worker::Worker;

pub struct Services {
    config: AppConfig,
    db: Arc<Database>,
    channel: Arc<dyn SourceChannel>,
    blobs: OnceCell<Arc<dyn BlobStore>>,
}

impl Services {
    /// Open the catalog and set up the configured channel. The channel
    /// connects lazily; the blob store is built on first use.
    pub fn init(config: &AppConfig) -> Result<Self> {
        let db = Database::open_with_timeout(&config.database_path(), config.database.busy_timeout_ms)?;
        let export_dir = config.channel.export_dir.as_deref().ok_or_else(|| {
            ReconcileError::Config("channel.export_dir is not set".to_string())
        })?;
        info!(database = %config.database.path, export = export_dir, "services initialised");
        Ok(Self::with_parts(
            config.clone(),
            Arc::new(db),
            Arc::new(ExportChannel::new(export_dir)),
        ))
    }

    pub fn with_parts(config: AppConfig, db: Arc<Database>, channel: Arc<dyn SourceChannel>) -> Self {
        Self {
            config,
            db,
            channel,
            blobs: OnceCell::new(),
        }
    }

    /// Use `blobs` instead of building one from config.
    pub fn with_blob_store(self, blobs: Arc<dyn BlobStore>) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(blobs);
        Self { blobs: cell, ..self }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn channel(&self) -> Arc<dyn SourceChannel> {
        self.channel.clone()
    }

    /// The configured blob store, created once.
    pub fn blob_store(&self) -> Result<Arc<dyn BlobStore>> {
        self.blobs
            .get_or_try_init(|| build_blob_store(&self.config))
            .cloned()
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(
            self.database(),
            self.channel(),
            self.blob_store()?,
            &self.config,
        ))
    }

    pub fn worker(&self) -> Result<Worker> {
        Ok(Worker::new(
            self.database(),
            self.channel(),
            self.blob_store()?,
            &self.config,
        ))
    }

    /// Best-effort channel disconnect, bounded by `timeouts.shutdown_secs`.
    pub async fn shutdown(&self) {
        match disconnect_within(self.channel.as_ref(), self.config.timeouts.shutdown_secs).await {
            Ok(()) => info!("services shut down"),
            Err(e) => warn!(error = %e, "channel shutdown failed"),
        }
    }
}

pub fn build_blob_store(config: &AppConfig) -> Result<Arc<dyn BlobStore>> {
    let blob = &config.blob;
    let store: Arc<dyn BlobStore> = match blob.backend {
        BlobBackend::Local => {
            let store = LocalBlobStore::new(&blob.local_root);
            Arc::new(match &blob.public_base_url {
                Some(base) => store.with_public_base_url(base),
                None => store,
            })
        }
        BlobBackend::Supabase => Arc::new(SupabaseBlobStore::from_config(blob)?),
        BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };
    info!(backend = store.name(), bucket = %blob.bucket, "blob store ready");
    Ok(store)
}
