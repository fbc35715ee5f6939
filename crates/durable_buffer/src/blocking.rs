use crate::error::{BufferError, Result};

/// Run a blocking filesystem call on tokio's blocking pool so it does not
/// stall the async workers.
pub(crate) async fn unblock<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BufferError::TaskFailed(e.to_string()))?
}
