//! Draining a buffer into a peer connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{buffer::DurableBuffer, error::BufferError};

/// How long [`forward_queue`] waits for a message before re-checking the connection
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound side of a peer connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Send buffered messages to `conn` until it closes.
///
/// An empty message closes the connection. If a send fails the message is put
/// back into the buffer, the connection is closed and the send error returned.
/// Other buffer errors are retried after `poll_interval`.
pub async fn forward_queue<T>(
    buffer: Arc<DurableBuffer>,
    conn: &T,
    poll_interval: Duration,
) -> anyhow::Result<()>
where
    T: Transport + ?Sized,
{
    while !conn.is_closed() {
        let msg = match buffer.get_timeout(poll_interval).await {
            Ok(msg) => msg,
            Err(BufferError::Timeout(_)) => continue,
            Err(e) => {
                // An unreadable message stays at the head until it expires
                error!(node_id = %buffer.node_id(), error = ?e, "Error getting data from buffer");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        if msg.is_empty() {
            debug!(node_id = %buffer.node_id(), "Empty message, closing connection");
            conn.close().await;
            return Ok(());
        }

        if let Err(e) = conn.send(&msg).await {
            warn!(node_id = %buffer.node_id(), error = ?e, "Send failed, requeueing message");
            if let Err(put_err) = buffer.put(msg).await {
                error!(node_id = %buffer.node_id(), error = ?put_err, "Failed to requeue message");
            }
            conn.close().await;
            return Err(e);
        }
    }
    debug!(node_id = %buffer.node_id(), "Connection closed, forwarder exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
        fail_sends: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
            if self.fail_sends {
                anyhow::bail!("connection reset");
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    async fn create_test_buffer() -> (Arc<DurableBuffer>, TempDir) {
        let tmp_dir = TempDir::new().unwrap();
        let buffer = DurableBuffer::open(tmp_dir.path(), "peer", BufferConfig::default())
            .await
            .unwrap();
        (Arc::new(buffer), tmp_dir)
    }

    #[tokio::test]
    async fn test_forwards_in_order_until_empty_message() {
        let (buffer, _tmp) = create_test_buffer().await;
        buffer.put(b"one".to_vec()).await.unwrap();
        buffer.put(b"two".to_vec()).await.unwrap();
        buffer.put(Vec::new()).await.unwrap();

        let conn = RecordingTransport::default();
        forward_queue(buffer.clone(), &conn, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(conn.is_closed());
        assert_eq!(*conn.sent.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_requeues_message() {
        let (buffer, _tmp) = create_test_buffer().await;
        buffer.put(b"precious".to_vec()).await.unwrap();

        let conn = RecordingTransport {
            fail_sends: true,
            ..Default::default()
        };
        let result = forward_queue(buffer.clone(), &conn, Duration::from_millis(50)).await;

        assert!(result.is_err());
        assert!(conn.is_closed());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get().await.unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_exits_when_connection_closes() {
        let (buffer, _tmp) = create_test_buffer().await;
        let conn = Arc::new(RecordingTransport::default());

        let task = {
            let conn = conn.clone();
            let buffer = buffer.clone();
            tokio::spawn(async move { forward_queue(buffer, conn.as_ref(), Duration::from_millis(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.close().await;

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(conn.sent.lock().unwrap().is_empty());
    }
}
