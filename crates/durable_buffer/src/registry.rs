//! Per-node buffer registry.
//!
//! The transport layer asks for a node's buffer every time it (re)connects to
//! that peer; the registry makes sure all of those connections share a single
//! [`DurableBuffer`], since two instances over the same manifest path would
//! overwrite each other's snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    buffer::{BufferConfig, DurableBuffer},
    error::Result,
    metrics::BufferMetrics,
};

/// Supplies the directory buffers are rooted in
pub trait BufferContext: Send + Sync {
    fn default_data_dir(&self) -> PathBuf;
}

impl BufferContext for PathBuf {
    fn default_data_dir(&self) -> PathBuf {
        self.clone()
    }
}

/// Hands out the buffer that belongs to a node
#[async_trait]
pub trait BufferManager: Send + Sync {
    /// Return the buffer for `node_id`, creating it on first use
    async fn get_buffer_for_node(
        &self,
        node_id: &str,
        ctx: &dyn BufferContext,
    ) -> Result<Arc<DurableBuffer>>;
}

/// File-backed [`BufferManager`]: one [`DurableBuffer`] per node for the
/// lifetime of the manager. Entries are never evicted.
#[derive(Default)]
pub struct FileBufferManager {
    buffers: RwLock<HashMap<String, Arc<DurableBuffer>>>,
    config: BufferConfig,
    metrics_registry: Option<prometheus::Registry>,
}

impl FileBufferManager {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            config,
            metrics_registry: None,
        }
    }

    /// Register per-node metrics in `registry` for every buffer created from now on
    pub fn with_metrics(mut self, registry: prometheus::Registry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// All buffers created so far
    pub async fn buffers(&self) -> Vec<Arc<DurableBuffer>> {
        self.buffers.read().await.values().cloned().collect()
    }

    /// Run an expiry sweep over every buffer. A failing buffer is logged and
    /// does not stop the others. Returns the number of messages dropped.
    pub async fn expire_all(&self) -> usize {
        let mut total = 0;
        for buffer in self.buffers().await {
            match buffer.expire().await {
                Ok(expired) => total += expired,
                Err(e) => {
                    error!(node_id = %buffer.node_id(), error = ?e, "Expiry sweep failed");
                }
            }
        }
        total
    }

    async fn create_buffer(&self, node_id: &str, base_dir: &Path) -> Result<Arc<DurableBuffer>> {
        let mut buffer = DurableBuffer::open(base_dir, node_id, self.config.clone()).await?;
        if let Some(registry) = &self.metrics_registry {
            match BufferMetrics::new(registry, node_id) {
                Ok(metrics) => buffer = buffer.with_metrics(Arc::new(metrics)),
                Err(e) => warn!(node_id = node_id, error = ?e, "Failed to register buffer metrics"),
            }
        }
        Ok(Arc::new(buffer))
    }
}

#[async_trait]
impl BufferManager for FileBufferManager {
    async fn get_buffer_for_node(
        &self,
        node_id: &str,
        ctx: &dyn BufferContext,
    ) -> Result<Arc<DurableBuffer>> {
        if let Some(buffer) = self.buffers.read().await.get(node_id) {
            return Ok(buffer.clone());
        }

        // Re-check under the write lock: another task may have won the race
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get(node_id) {
            debug!(node_id = node_id, "Buffer created concurrently, reusing");
            return Ok(buffer.clone());
        }

        let base_dir = ctx.default_data_dir();
        let buffer = self.create_buffer(node_id, &base_dir).await?;
        buffers.insert(node_id.to_string(), buffer.clone());
        info!(node_id = node_id, base_dir = %base_dir.display(), "Registered durable buffer");
        Ok(buffer)
    }
}

static GLOBAL_MANAGER: OnceLock<Arc<FileBufferManager>> = OnceLock::new();

/// Install the process-wide manager. Returns false if one was already set.
pub fn init_global_manager(manager: FileBufferManager) -> bool {
    GLOBAL_MANAGER.set(Arc::new(manager)).is_ok()
}

/// The process-wide manager, created with default settings on first use
pub fn global_manager() -> Arc<FileBufferManager> {
    GLOBAL_MANAGER
        .get_or_init(|| Arc::new(FileBufferManager::default()))
        .clone()
}
