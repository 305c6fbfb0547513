use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, time};
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Codec(String),
    #[error("Database error: {0}")]
    Custom(String),
}

/// A single JSON record on disk, readable and writable by the owner only.
///
/// Reads fail soft: anything that cannot be turned back into a `T` is
/// reported as absent. Writes go to a sibling temp file which is renamed
/// over the record, so readers never see a half-written file.
#[derive(Clone, Debug)]
pub struct Database<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Database<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Option<T> {
        let meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No record at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to stat {}: {}", self.path.display(), e);
                return None;
            }
        };

        if !owner_only(&meta) {
            warn!(
                "Ignoring {} - readable or writable by other users",
                self.path.display()
            );
            return None;
        }

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Failed to parse {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, record: &T) -> Result<(), DbError> {
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|e| DbError::Codec(e.to_string()))?;

        match time::timeout(Duration::from_secs(5), self.write_atomic(&bytes)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Database save operation timed out");
                Err(DbError::Custom("Save operation timed out".into()))
            }
        }
    }

    pub async fn clear(&self) -> Result<(), DbError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), DbError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = open_private(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &self.path).await {
            fs::remove_file(&tmp).await.ok();
            return Err(DbError::Io(e));
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::PermissionsExt;

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    // `mode` only applies when the file is created; a leftover temp file keeps its old bits.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .await?;
    Ok(file)
}

#[cfg(not(unix))]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

#[cfg(unix)]
fn owner_only(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o077 == 0
}

#[cfg(not(unix))]
fn owner_only(_meta: &std::fs::Metadata) -> bool {
    true
}
