use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::blocking::unblock;
use crate::error::{BufferError, Result};

/// Directory of immutable payload files, one per pending message, named by
/// the message identifier
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// Create the store directory with `mode` permissions.
    /// An existing directory is reused as is.
    pub fn create_blocking(dir: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let dir = dir.into();
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        match builder.create(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "Payload directory ready"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(BufferError::io("create payload dir", &dir, e)),
        }
        Ok(Self { dir })
    }

    pub async fn create(dir: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let dir = dir.into();
        unblock(move || Self::create_blocking(dir, mode)).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, ident: Uuid) -> PathBuf {
        self.dir.join(ident.to_string())
    }

    pub async fn write(&self, ident: Uuid, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(ident);
        unblock(move || {
            let mut file =
                fs::File::create(&path).map_err(|e| BufferError::io("create payload", &path, e))?;
            file.write_all(&data)
                .map_err(|e| BufferError::io("write payload", &path, e))?;
            trace!(path = %path.display(), len = data.len(), "Wrote payload");
            Ok(())
        })
        .await
    }

    /// Open the payload for streaming reads. The file is left in place.
    pub async fn open(&self, ident: Uuid) -> Result<tokio::fs::File> {
        let path = self.path_for(ident);
        let file = unblock(move || {
            fs::File::open(&path).map_err(|e| BufferError::io("open payload", &path, e))
        })
        .await?;
        Ok(tokio::fs::File::from_std(file))
    }

    pub async fn read(&self, ident: Uuid) -> Result<Vec<u8>> {
        let path = self.path_for(ident);
        unblock(move || fs::read(&path).map_err(|e| BufferError::io("read payload", &path, e)))
            .await
    }

    pub async fn remove(&self, ident: Uuid) -> Result<()> {
        let path = self.path_for(ident);
        unblock(move || {
            fs::remove_file(&path).map_err(|e| BufferError::io("remove payload", &path, e))
        })
        .await
    }

    pub async fn contains(&self, ident: Uuid) -> Result<bool> {
        let path = self.path_for(ident);
        unblock(move || {
            path.try_exists()
                .map_err(|e| BufferError::io("stat payload", &path, e))
        })
        .await
    }
}
