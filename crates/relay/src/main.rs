use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mesh_durable_buffer::forward::DEFAULT_POLL_INTERVAL;
use mesh_durable_buffer::{
    BufferManager, FileBufferManager, Transport, forward_queue, global_manager,
    init_global_manager, spawn_expiry_sweeper,
};
use mesh_infra::AppConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Writes each message as one line on stdout
struct StdoutTransport {
    out: Mutex<tokio::io::Stdout>,
    closed: AtomicBool,
}

impl StdoutTransport {
    fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(data).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::dev();
    config.init_tracing()?;
    config.print_args();

    let registry = prometheus::Registry::new();
    let manager = FileBufferManager::new(config.buffer_config()).with_metrics(registry.clone());
    if !init_global_manager(manager) {
        warn!("buffer manager already initialized, reusing it");
    }
    let manager = global_manager();

    // Fails here if the manifest on disk is corrupt
    let buffer = manager
        .get_buffer_for_node(config.node_id(), &config)
        .await?;
    info!(node_id = %config.node_id(), pending = buffer.len(), "Buffer ready");

    let sweeper = spawn_expiry_sweeper(manager.clone(), *config.expire_interval());

    let conn = Arc::new(StdoutTransport::new());
    let forwarder = {
        let buffer = buffer.clone();
        let conn = conn.clone();
        tokio::spawn(async move { forward_queue(buffer, conn.as_ref(), DEFAULT_POLL_INTERVAL).await })
    };

    // One message per non-empty stdin line; EOF queues the empty message that
    // tells the forwarder to close
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        buffer.put(line.into_bytes()).await?;
    }
    buffer.put(Vec::new()).await?;

    match forwarder.await? {
        Ok(()) => info!(stats = ?buffer.stats(), "Relay finished"),
        Err(e) => error!(error = ?e, stats = ?buffer.stats(), "Forwarding stopped"),
    }
    sweeper.abort();

    match prometheus::TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = ?e, "Failed to encode metrics"),
    }
    Ok(())
}
