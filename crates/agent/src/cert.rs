//! TLS material: bring-your-own or issued by the coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cluster::{ClusterError, ClusterService};
use crate::config::ClusterConfig;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate request failed: {0}")]
    Cluster(#[from] ClusterError),
}

/// PEM files ready for the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub struct CertificateService {
    config: Arc<ClusterConfig>,
    cluster: Arc<ClusterService>,
    dir: PathBuf,
}

impl CertificateService {
    pub fn new(config: Arc<ClusterConfig>, cluster: Arc<ClusterService>) -> Self {
        Self::with_dir(config, cluster, std::env::temp_dir().join("openbmclapi"))
    }

    pub fn with_dir(config: Arc<ClusterConfig>, cluster: Arc<ClusterService>, dir: PathBuf) -> Self {
        Self {
            config,
            cluster,
            dir,
        }
    }

    /// `None` means serve plain HTTP.
    pub async fn setup(&self) -> Result<Option<TlsPaths>, CertError> {
        if self.config.byoc {
            let (Some(cert), Some(key)) = (&self.config.ssl_cert, &self.config.ssl_key) else {
                tracing::info!("BYOC without certificate material, serving plain HTTP");
                return Ok(None);
            };
            tracing::info!("using provided certificate");
            let cert = load_material(cert).await?;
            let key = load_material(key).await?;
            return Ok(Some(self.write(&cert, &key).await?));
        }

        tracing::info!("requesting certificate from the coordinator");
        let issued = self.cluster.request_cert().await?;
        Ok(Some(self.write(&issued.cert, &issued.key).await?))
    }

    async fn write(&self, cert: &str, key: &str) -> Result<TlsPaths, CertError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let paths = TlsPaths {
            cert: self.dir.join("cert.pem"),
            key: self.dir.join("key.pem"),
        };
        tokio::fs::write(&paths.cert, cert).await?;
        tokio::fs::write(&paths.key, key).await?;
        tracing::debug!(cert = ?paths.cert, key = ?paths.key, "certificate written");
        Ok(paths)
    }
}

/// A path to a PEM file, or the PEM text itself.
async fn load_material(value: &str) -> Result<String, CertError> {
    let path = Path::new(value);
    if !value.contains('\n') && tokio::fs::try_exists(path).await.unwrap_or(false) {
        Ok(tokio::fs::read_to_string(path).await?)
    } else {
        Ok(value.to_string())
    }
}
