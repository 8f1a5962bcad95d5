use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::alist::{AlistConfig, AlistStorage};
use crate::backend::Storage;
use crate::error::{Result, StorageError};
use crate::file::FileStorage;
use crate::object::{MinioConfig, ObjectStorage, OssConfig};
use crate::options::StorageOptions;
use crate::webdav::{WebdavConfig, WebdavStorage};

/// Closed set of backends selectable with `CLUSTER_STORAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    File,
    Webdav,
    Alist,
    Minio,
    Oss,
}

impl FromStr for StorageKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "webdav" => Ok(Self::Webdav),
            "alist" => Ok(Self::Alist),
            "minio" => Ok(Self::Minio),
            "oss" => Ok(Self::Oss),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Webdav => "webdav",
            Self::Alist => "alist",
            Self::Minio => "minio",
            Self::Oss => "oss",
        };
        f.write_str(name)
    }
}

/// Build the configured backend. `cache_dir` roots the `file` backend.
pub fn create_storage(
    kind: StorageKind,
    options: &StorageOptions,
    cache_dir: &Path,
) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match kind {
        StorageKind::File => Arc::new(FileStorage::new(cache_dir)),
        StorageKind::Webdav => Arc::new(WebdavStorage::new(WebdavConfig::from_options(options)?)?),
        StorageKind::Alist => Arc::new(AlistStorage::new(AlistConfig::from_options(options)?)?),
        StorageKind::Minio => Arc::new(ObjectStorage::minio(MinioConfig::from_options(options)?)?),
        StorageKind::Oss => Arc::new(ObjectStorage::oss(OssConfig::from_options(options)?)?),
    };
    tracing::info!(storage = %kind, "using storage backend");
    Ok(storage)
}
