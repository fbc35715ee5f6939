use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    blocking::unblock,
    error::{BufferError, Result},
    item::ItemMetadata,
    manifest::Manifest,
    metrics::BufferMetrics,
    payload::PayloadStore,
};

/// Subdirectory of the base directory holding payload files
pub const MESSAGES_DIR: &str = "messages";

/// Configuration for a durable buffer
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// How long a message may wait before the expiry sweep drops it
    pub ttl: Duration,
    /// Permissions of the payload directory
    pub dir_mode: u32,
    /// fsync the manifest before renaming it into place
    pub sync_manifest: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            dir_mode: 0o700,
            sync_manifest: false,
        }
    }
}

/// Options for [`DurableBuffer::get_with`]
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Hand back an open file instead of reading it. The file is not removed.
    pub handle_only: bool,
    /// Remove the payload file after reading it
    pub delete: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            handle_only: false,
            delete: true,
        }
    }
}

/// A delivered message
#[derive(Debug)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Open handle to the payload file; the caller reads and closes it
    Handle(tokio::fs::File),
}

impl Payload {
    /// Consume the payload into its bytes, reading the file if needed
    pub async fn into_vec(self) -> std::io::Result<Vec<u8>> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Handle(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

/// Statistics about a durable buffer
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub pending: usize,
    pub oldest_expiry: Option<DateTime<Utc>>,
    pub newest_expiry: Option<DateTime<Utc>>,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_expired: u64,
    pub last_expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BufferCounters {
    total_puts: u64,
    total_gets: u64,
    total_expired: u64,
    last_expire_at: Option<DateTime<Utc>>,
}

/// Disk-backed FIFO of opaque messages for one node.
///
/// Payload bytes live in `<base>/messages/<ident>`, the queue order lives in
/// memory and is mirrored to `<base>/manifest-<node_id>` after every
/// mutation so it can be rebuilt on restart.
pub struct DurableBuffer {
    node_id: String,
    config: BufferConfig,
    payloads: PayloadStore,
    manifest: Manifest,
    queue: Arc<Mutex<VecDeque<ItemMetadata>>>,
    available: Notify,
    // Serializes manifest rewrites and expiry sweeps. A rewrite keeps it
    // until the file is in place, even if its caller went away.
    manifest_lock: Arc<tokio::sync::Mutex<()>>,
    counters: Mutex<BufferCounters>,
    metrics: Option<Arc<BufferMetrics>>,
}

impl DurableBuffer {
    /// Open the buffer for `node_id` under `base_dir`, recovering any
    /// messages listed in an existing manifest.
    pub async fn open(
        base_dir: impl AsRef<Path>,
        node_id: &str,
        config: BufferConfig,
    ) -> Result<Self> {
        validate_node_id(node_id)?;
        let base_dir = base_dir.as_ref();

        let payloads = PayloadStore::create(base_dir.join(MESSAGES_DIR), config.dir_mode).await?;
        let manifest = Manifest::for_node(base_dir, node_id, config.sync_manifest);
        let recovered = manifest.load().await?;

        info!(
            node_id = node_id,
            recovered = recovered.len(),
            manifest = %manifest.path().display(),
            "Opened durable buffer"
        );

        Ok(Self {
            node_id: node_id.to_string(),
            config,
            payloads,
            manifest,
            queue: Arc::new(Mutex::new(recovered.into())),
            available: Notify::new(),
            manifest_lock: Arc::new(tokio::sync::Mutex::new(())),
            counters: Mutex::new(BufferCounters::default()),
            metrics: None,
        })
    }

    /// Attach metrics to this buffer
    pub fn with_metrics(mut self, metrics: Arc<BufferMetrics>) -> Self {
        metrics.update_pending(self.len());
        self.metrics = Some(metrics);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn manifest_path(&self) -> &Path {
        self.manifest.path()
    }

    pub fn payload_path(&self, ident: Uuid) -> PathBuf {
        self.payloads.path_for(ident)
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    /// Snapshot of the queued metadata, oldest first
    pub fn pending(&self) -> Vec<ItemMetadata> {
        self.lock_queue().iter().copied().collect()
    }

    /// Store `data` and append it to the queue.
    ///
    /// A failed payload write leaves the queue untouched. A failed manifest
    /// rewrite is reported, but the message stays queued and will still be
    /// delivered by this process.
    pub async fn put(&self, data: impl Into<Vec<u8>>) -> Result<Uuid> {
        let start = Instant::now();
        let item = ItemMetadata::new(self.ttl());

        if let Err(e) = self.payloads.write(item.ident(), data.into()).await {
            error!(node_id = %self.node_id, error = ?e, "Failed to persist payload");
            if let Some(metrics) = &self.metrics {
                metrics.record_put(0.0, false);
            }
            return Err(e);
        }

        self.lock_queue().push_back(item);
        self.available.notify_one();
        self.lock_counters().total_puts += 1;

        let saved = self.save_manifest().await;
        let duration = start.elapsed().as_secs_f64() * 1000.0;
        if let Some(metrics) = &self.metrics {
            metrics.record_put(duration, saved.is_ok());
        }
        if let Err(e) = saved {
            error!(
                node_id = %self.node_id,
                ident = %item.ident(),
                error = ?e,
                "Message queued but manifest rewrite failed"
            );
            return Err(e);
        }

        debug!(node_id = %self.node_id, ident = %item.ident(), duration_ms = duration, "Buffered message");
        Ok(item.ident())
    }

    /// Wait for the oldest message, remove it from the queue and return its bytes
    pub async fn get(&self) -> Result<Vec<u8>> {
        let payload = self.get_with(GetOptions::default()).await?;
        into_bytes(payload, &self.node_id).await
    }

    /// Like [`get`](Self::get), but fails with [`BufferError::Timeout`] when
    /// no message arrives within `timeout`
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let payload = self.get_timeout_with(timeout, GetOptions::default()).await?;
        into_bytes(payload, &self.node_id).await
    }

    /// Wait for the oldest message and deliver it according to `opts`.
    ///
    /// Entries whose payload file is gone are skipped. The manifest is
    /// rewritten before the payload is touched, so a crash after this point
    /// never hands the same message out twice.
    ///
    /// Cancel safe: if the future is dropped after a message was popped but
    /// before it was handed over, the message goes back to the head of the
    /// queue.
    pub async fn get_with(&self, opts: GetOptions) -> Result<Payload> {
        loop {
            let claim = self.next_item().await;
            if let Some(payload) = self.deliver(claim, opts).await? {
                return Ok(payload);
            }
        }
    }

    pub async fn get_timeout_with(&self, timeout: Duration, opts: GetOptions) -> Result<Payload> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let claim = tokio::time::timeout_at(deadline, self.next_item())
                .await
                .map_err(|_| BufferError::Timeout(timeout))?;
            if let Some(payload) = self.deliver(claim, opts).await? {
                return Ok(payload);
            }
        }
    }

    /// Drop every message whose expiry has passed, deleting its payload.
    /// Returns the number of messages dropped.
    pub async fn expire(&self) -> Result<usize> {
        let guard = self.manifest_lock.clone().lock_owned().await;
        let start = Instant::now();
        let now = Utc::now();

        let expired: Vec<ItemMetadata> = {
            let mut queue = self.lock_queue();
            let (expired, kept): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|item| item.is_expired_at(now));
            *queue = kept.into();
            expired
        };

        let mut first_err = None;
        for item in &expired {
            info!(node_id = %self.node_id, ident = %item.ident(), expire_at = %item.expire_at(), "Expiring message");
            match self.payloads.remove(item.ident()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(ident = %item.ident(), "Expired payload already gone");
                }
                Err(e) => {
                    error!(node_id = %self.node_id, ident = %item.ident(), error = ?e, "Failed to remove expired payload");
                    first_err.get_or_insert(e);
                }
            }
        }

        let saved = if expired.is_empty() {
            drop(guard);
            Ok(())
        } else {
            self.write_manifest_locked(guard).await
        };

        {
            let mut counters = self.lock_counters();
            counters.total_expired += expired.len() as u64;
            counters.last_expire_at = Some(now);
        }

        let duration = start.elapsed().as_secs_f64() * 1000.0;
        let success = first_err.is_none() && saved.is_ok();
        if let Some(metrics) = &self.metrics {
            metrics.record_expire(expired.len() as u64, duration, success);
        }
        if !expired.is_empty() {
            info!(
                node_id = %self.node_id,
                expired = expired.len(),
                remaining = self.len(),
                duration_ms = duration,
                "Expired messages"
            );
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        saved?;
        Ok(expired.len())
    }

    pub fn stats(&self) -> BufferStats {
        let (pending, oldest_expiry, newest_expiry) = {
            let queue = self.lock_queue();
            (
                queue.len(),
                queue.iter().map(|item| item.expire_at()).min(),
                queue.iter().map(|item| item.expire_at()).max(),
            )
        };
        let counters = self.lock_counters();
        BufferStats {
            pending,
            oldest_expiry,
            newest_expiry,
            total_puts: counters.total_puts,
            total_gets: counters.total_gets,
            total_expired: counters.total_expired,
            last_expire_at: counters.last_expire_at,
        }
    }

    /// Pop the head of the queue, waiting for a put if it is empty.
    /// Nothing is removed unless the future completes.
    async fn next_item(&self) -> Claim<'_> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self.lock_queue().pop_front();
            if let Some(item) = popped {
                return Claim {
                    buffer: self,
                    item,
                    armed: true,
                };
            }
            notified.await;
        }
    }

    /// Hand a popped item to the caller. `None` means its payload was missing.
    async fn deliver(&self, claim: Claim<'_>, opts: GetOptions) -> Result<Option<Payload>> {
        let start = Instant::now();
        let item = claim.item;

        // The item is already ours; a failed rewrite only widens the window in
        // which a restart could surface it again.
        if let Err(e) = self.save_manifest().await {
            error!(node_id = %self.node_id, ident = %item.ident(), error = ?e, "Failed to persist manifest after pop");
        }

        let read = self.read_payload(item.ident(), opts).await;
        claim.release();
        match read {
            Ok(payload) => {
                self.lock_counters().total_gets += 1;
                let duration = start.elapsed().as_secs_f64() * 1000.0;
                if let Some(metrics) = &self.metrics {
                    metrics.record_get(duration, true);
                }
                debug!(node_id = %self.node_id, ident = %item.ident(), "Delivered message");
                Ok(Some(payload))
            }
            Err(e) if e.is_not_found() => {
                match &self.metrics {
                    Some(metrics) => metrics.record_missing_payload(&item.file_name()),
                    None => warn!(node_id = %self.node_id, ident = %item.ident(), "Payload missing for queued message, skipping"),
                }
                Ok(None)
            }
            Err(e) => {
                // The payload is still on disk, so the message stays queued
                error!(node_id = %self.node_id, ident = %item.ident(), error = ?e, "Failed to read payload, requeueing message");
                self.restore(item);
                if let Err(save_err) = self.save_manifest().await {
                    error!(node_id = %self.node_id, ident = %item.ident(), error = ?save_err, "Failed to persist requeued message");
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_get(0.0, false);
                }
                Err(e)
            }
        }
    }

    async fn read_payload(&self, ident: Uuid, opts: GetOptions) -> Result<Payload> {
        if opts.handle_only {
            return self.payloads.open(ident).await.map(Payload::Handle);
        }

        let bytes = self.payloads.read(ident).await?;
        if opts.delete {
            if let Err(e) = self.payloads.remove(ident).await {
                warn!(node_id = %self.node_id, ident = %ident, error = ?e, "Failed to remove delivered payload");
            }
        }
        Ok(Payload::Bytes(bytes))
    }

    /// Put a claimed item back at the head of the queue
    fn restore(&self, item: ItemMetadata) {
        self.lock_queue().push_front(item);
        self.available.notify_one();
    }

    /// Requeue an item whose consumer went away. The manifest is rewritten
    /// from a detached task on the current runtime.
    fn restore_detached(&self, item: ItemMetadata) {
        self.restore(item);
        warn!(node_id = %self.node_id, ident = %item.ident(), "Get dropped before delivery, message requeued");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(node_id = %self.node_id, "No runtime to persist requeued message, manifest is stale until the next change");
            return;
        };
        let queue = self.queue.clone();
        let manifest = self.manifest.clone();
        let lock = self.manifest_lock.clone();
        let node_id = self.node_id.clone();
        handle.spawn(async move {
            let guard = lock.lock_owned().await;
            if let Err(e) = store_snapshot(manifest, &queue, guard).await {
                error!(node_id = %node_id, error = ?e, "Failed to persist requeued message");
            }
        });
    }

    async fn save_manifest(&self) -> Result<()> {
        let guard = self.manifest_lock.clone().lock_owned().await;
        self.write_manifest_locked(guard).await
    }

    async fn write_manifest_locked(&self, guard: OwnedMutexGuard<()>) -> Result<()> {
        let start = Instant::now();
        let result = store_snapshot(self.manifest.clone(), &self.queue, guard).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_manifest_write(start.elapsed().as_secs_f64() * 1000.0, result.is_ok());
            metrics.update_pending(self.len());
        }
        result
    }

    fn ttl(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.ttl).unwrap_or(TimeDelta::MAX)
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<ItemMetadata>> {
        lock_items(&self.queue)
    }

    fn lock_counters(&self) -> MutexGuard<'_, BufferCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A popped item on its way to a consumer. Dropped before
/// [`release`](Self::release), it goes back to the head of the queue.
struct Claim<'a> {
    buffer: &'a DurableBuffer,
    item: ItemMetadata,
    armed: bool,
}

impl Claim<'_> {
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.buffer.restore_detached(self.item);
        }
    }
}

// Every critical section leaves the queue consistent, so a poisoned lock
// is still safe to use.
fn lock_items(queue: &Mutex<VecDeque<ItemMetadata>>) -> MutexGuard<'_, VecDeque<ItemMetadata>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rewrite `manifest` from the current contents of `queue`. The snapshot is
/// taken under `guard`, and the guard lives until the blocking write returns.
async fn store_snapshot(
    manifest: Manifest,
    queue: &Mutex<VecDeque<ItemMetadata>>,
    guard: OwnedMutexGuard<()>,
) -> Result<()> {
    let snapshot: Vec<ItemMetadata> = lock_items(queue).iter().copied().collect();
    unblock(move || {
        let _guard = guard;
        manifest.store_blocking(&snapshot)
    })
    .await
}

async fn into_bytes(payload: Payload, node_id: &str) -> Result<Vec<u8>> {
    payload
        .into_vec()
        .await
        .map_err(|e| BufferError::StorageError(anyhow::anyhow!("read payload for {}: {}", node_id, e)))
}

/// Node ids become part of the manifest file name
pub(crate) fn validate_node_id(node_id: &str) -> Result<()> {
    let invalid = node_id.is_empty()
        || node_id == "."
        || node_id == ".."
        || node_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BufferError::InvalidNodeId(node_id.to_string()));
    }
    Ok(())
}
