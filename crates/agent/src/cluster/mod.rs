//! Control-plane state machine plus manifest, configuration and sync calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::prelude::{
    decode_file_list, AgentConfiguration, CertificateResponse, EnableRequest, FileList,
    KeepAliveRequest, ManifestError, SyncConfig,
};
use common::version::PROTOCOL_VERSION;
use parking_lot::Mutex;
use reqwest::StatusCode;
use storage::prelude::Storage;

use crate::client::{ApiError, CoordinatorClient};
use crate::config::ClusterConfig;
use crate::control::{Ack, ControlConnection, ControlError};
use crate::nat::{NatError, NatService};
use crate::token::{TokenError, TokenManager};

pub mod sync;

pub use sync::{Downloader, SyncError};

const FILES_PATH: &str = "/openbmclapi/files";
const CONFIGURATION_PATH: &str = "/openbmclapi/configuration";
/// The coordinator probes the node before acking `enable`.
const ENABLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("control connection error: {0}")]
    Control(#[from] ControlError),
    #[error("coordinator request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nat error: {0}")]
    Nat(#[from] NatError),
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("not connected to the coordinator")]
    NotConnected,
    #[error("cluster is not enabled")]
    NotEnabled,
    #[error("coordinator rejected {event}: {reason}")]
    Rejected { event: &'static str, reason: String },
}

#[derive(Debug, Clone, Default)]
enum ConnectionState {
    #[default]
    Disconnected,
    Connected(Arc<ControlConnection>),
    Enabled(Arc<ControlConnection>),
}

/// The slice of the cluster the keepalive loop drives.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    fn is_enabled(&self) -> bool;
    async fn keep_alive(&self, report: &KeepAliveRequest) -> Result<Ack, ClusterError>;
    async fn connect(&self) -> Result<(), ClusterError>;
    async fn enable(&self) -> Result<(), ClusterError>;
    async fn disable(&self) -> Result<(), ClusterError>;
}

#[derive(Debug)]
pub struct ClusterService {
    config: Arc<ClusterConfig>,
    client: CoordinatorClient,
    tokens: Arc<TokenManager>,
    nat: Arc<NatService>,
    downloader: Downloader,
    state: Mutex<ConnectionState>,
    transition: tokio::sync::Mutex<()>,
}

impl ClusterService {
    pub fn new(
        config: Arc<ClusterConfig>,
        client: CoordinatorClient,
        tokens: Arc<TokenManager>,
        storage: Arc<dyn Storage>,
        nat: Arc<NatService>,
    ) -> Self {
        let downloader = Downloader::new(client.clone(), tokens.clone(), storage);
        Self {
            config,
            client,
            tokens,
            nat,
            downloader,
            state: Mutex::new(ConnectionState::Disconnected),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// The state with dead connections folded into `Disconnected`.
    fn current(&self) -> ConnectionState {
        let mut state = self.state.lock();
        let alive = match &*state {
            ConnectionState::Connected(conn) | ConnectionState::Enabled(conn) => conn.is_connected(),
            ConnectionState::Disconnected => true,
        };
        if !alive {
            tracing::warn!("control connection lost, cluster is no longer enabled");
            *state = ConnectionState::Disconnected;
        }
        state.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.current(), ConnectionState::Disconnected)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.current(), ConnectionState::Enabled(_))
    }

    /// Open the control connection unless a live one exists.
    pub async fn connect(&self) -> Result<(), ClusterError> {
        let _transition = self.transition.lock().await;
        if !matches!(self.current(), ConnectionState::Disconnected) {
            tracing::debug!("already connected to the coordinator");
            return Ok(());
        }

        let token = self.tokens.get_token().await?;
        let connection = ControlConnection::connect(&self.config.bmclapi, &token).await?;
        self.set_state(ConnectionState::Connected(Arc::new(connection)));
        Ok(())
    }

    /// Announce the node as ready to serve.
    pub async fn enable(&self) -> Result<(), ClusterError> {
        let _transition = self.transition.lock().await;
        let connection = match self.current() {
            ConnectionState::Enabled(_) => return Ok(()),
            ConnectionState::Disconnected => return Err(ClusterError::NotConnected),
            ConnectionState::Connected(connection) => connection,
        };

        let nat_ip = match self.nat.start_if_enabled().await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::error!(error = %e, "UPnP port mapping failed");
                return Err(e.into());
            }
        };
        let host = self
            .config
            .cluster_ip
            .clone()
            .or_else(|| nat_ip.map(|ip| ip.to_string()));

        let request = EnableRequest {
            host,
            port: self.config.public_port,
            version: PROTOCOL_VERSION.to_string(),
            byoc: self.config.byoc,
            no_fast_enable: false,
            flavor: self.config.flavor(),
        };
        tracing::debug!(request = ?request, "enabling cluster");

        let ack = connection
            .emit_with_ack_timeout("enable", Some(serde_json::to_value(&request)?), ENABLE_TIMEOUT)
            .await?;
        match ack {
            Ack::Success(_) => {
                self.set_state(ConnectionState::Enabled(connection));
                tracing::info!(port = request.port, "cluster enabled");
                Ok(())
            }
            Ack::Kicked => Err(ClusterError::Rejected {
                event: "enable",
                reason: "coordinator declined".to_string(),
            }),
            Ack::Failure(reason) => Err(ClusterError::Rejected {
                event: "enable",
                reason,
            }),
        }
    }

    /// Leave the enabled state and drop the control connection.
    pub async fn disable(&self) -> Result<(), ClusterError> {
        let _transition = self.transition.lock().await;
        let previous = std::mem::take(&mut *self.state.lock());
        match previous {
            ConnectionState::Enabled(connection) | ConnectionState::Connected(connection) => {
                connection.close();
                tracing::info!("cluster disabled");
            }
            ConnectionState::Disconnected => {}
        }
        Ok(())
    }

    /// Final teardown of the control connection.
    pub async fn close(&self) {
        if let Err(e) = self.disable().await {
            tracing::warn!(error = %e, "error closing control connection");
        }
    }

    /// Ask the coordinator for a TLS certificate, connecting first if needed.
    pub async fn request_cert(&self) -> Result<CertificateResponse, ClusterError> {
        self.connect().await?;
        let connection = match self.current() {
            ConnectionState::Connected(connection) | ConnectionState::Enabled(connection) => connection,
            ConnectionState::Disconnected => return Err(ClusterError::NotConnected),
        };

        tracing::debug!("requesting certificate from the coordinator");
        match connection.emit_with_ack("request-cert", None).await? {
            Ack::Success(value) => Ok(serde_json::from_value(value)?),
            Ack::Kicked => Err(ClusterError::Rejected {
                event: "request-cert",
                reason: "empty response".to_string(),
            }),
            Ack::Failure(reason) => Err(ClusterError::Rejected {
                event: "request-cert",
                reason,
            }),
        }
    }

    /// Report traffic since the last accepted report.
    pub async fn keep_alive(&self, report: &KeepAliveRequest) -> Result<Ack, ClusterError> {
        let connection = match self.current() {
            ConnectionState::Enabled(connection) => connection,
            _ => return Err(ClusterError::NotEnabled),
        };
        Ok(connection
            .emit_with_ack("keep-alive", Some(serde_json::to_value(report)?))
            .await?)
    }

    /// The manifest, or only entries changed after `last_modified`.
    pub async fn get_file_list(&self, last_modified: Option<i64>) -> Result<FileList, ClusterError> {
        let token = self.tokens.get_token().await?;
        let query: Vec<(&str, String)> = last_modified
            .map(|ts| vec![("lastModified", ts.to_string())])
            .unwrap_or_default();

        let response = self.client.get_bytes(FILES_PATH, &query, Some(&token)).await?;
        if response.status == StatusCode::NO_CONTENT {
            return Ok(FileList::default());
        }

        let list = decode_file_list(&response.body, response.content_type.as_deref())?;
        tracing::debug!(files = list.len(), last_modified = ?last_modified, "fetched file list");
        Ok(list)
    }

    pub async fn get_configuration(&self) -> Result<AgentConfiguration, ClusterError> {
        let token = self.tokens.get_token().await?;
        Ok(self.client.get_json(CONFIGURATION_PATH, &[], Some(&token)).await?)
    }

    pub async fn sync_files(&self, list: &FileList, config: &SyncConfig) -> Result<usize, ClusterError> {
        Ok(self.downloader.sync(list, config).await?)
    }
}

#[async_trait]
impl ClusterControl for ClusterService {
    fn is_enabled(&self) -> bool {
        ClusterService::is_enabled(self)
    }

    async fn keep_alive(&self, report: &KeepAliveRequest) -> Result<Ack, ClusterError> {
        ClusterService::keep_alive(self, report).await
    }

    async fn connect(&self) -> Result<(), ClusterError> {
        ClusterService::connect(self).await
    }

    async fn enable(&self) -> Result<(), ClusterError> {
        ClusterService::enable(self).await
    }

    async fn disable(&self) -> Result<(), ClusterError> {
        ClusterService::disable(self).await
    }
}
