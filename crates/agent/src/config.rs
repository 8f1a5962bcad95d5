use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use common::prelude::Flavor;
use storage::prelude::{StorageKind, StorageOptions};
use url::Url;

pub const DEFAULT_BMCLAPI: &str = "https://openbmclapi.bangbang93.com";

#[derive(Parser, Debug, Clone)]
#[command(name = "bmclapi-agent")]
#[command(about = "OpenBMCLAPI edge-cache node agent", version)]
pub struct Args {
    /// Cluster id issued by the coordinator
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Shared secret used for challenge signing and URL verification
    #[arg(long, env = "CLUSTER_SECRET", hide_env_values = true)]
    pub cluster_secret: String,

    /// Public address announced to the coordinator, overrides UPnP
    #[arg(long, env = "CLUSTER_IP")]
    pub cluster_ip: Option<String>,

    /// Local port the HTTP server listens on
    #[arg(long, env = "CLUSTER_PORT", default_value_t = 4000)]
    pub cluster_port: u16,

    /// Port announced to the coordinator (defaults to the local port)
    #[arg(long, env = "CLUSTER_PUBLIC_PORT")]
    pub cluster_public_port: Option<u16>,

    /// Bring your own certificate instead of requesting one
    #[arg(
        long,
        env = "CLUSTER_BYOC",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub cluster_byoc: bool,

    #[arg(
        long,
        env = "DISABLE_ACCESS_LOG",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub disable_access_log: bool,

    /// Map the public port on the local gateway via UPnP
    #[arg(
        long,
        env = "ENABLE_UPNP",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub enable_upnp: bool,

    /// Storage backend: file, webdav, alist, minio or oss
    #[arg(long, env = "CLUSTER_STORAGE", default_value = "file")]
    pub cluster_storage: String,

    /// Backend options as a JSON object of strings
    #[arg(long, env = "CLUSTER_STORAGE_OPTIONS", default_value = "{}")]
    pub cluster_storage_options: String,

    /// Root directory of the file backend
    #[arg(long, env = "CACHE_DIR", default_value = "./cache")]
    pub cache_dir: PathBuf,

    /// TLS certificate, a path or inline PEM
    #[arg(long, env = "SSL_CERT")]
    pub ssl_cert: Option<String>,

    /// TLS private key, a path or inline PEM
    #[arg(long, env = "SSL_KEY", hide_env_values = true)]
    pub ssl_key: Option<String>,

    /// Coordinator base URL
    #[arg(long, env = "CLUSTER_BMCLAPI", default_value = DEFAULT_BMCLAPI)]
    pub cluster_bmclapi: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

/// Process-wide settings, parsed once and shared read-only.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub cluster_secret: String,
    pub cluster_ip: Option<String>,
    pub port: u16,
    pub public_port: u16,
    pub byoc: bool,
    pub disable_access_log: bool,
    pub enable_upnp: bool,
    pub storage: StorageKind,
    pub storage_options: StorageOptions,
    pub cache_dir: PathBuf,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub bmclapi: Url,
    pub log_level: tracing::Level,
    pub log_dir: Option<PathBuf>,
}

impl ClusterConfig {
    /// Defaults for everything except identity and coordinator.
    pub fn new(cluster_id: impl Into<String>, cluster_secret: impl Into<String>, bmclapi: Url) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            cluster_secret: cluster_secret.into(),
            cluster_ip: None,
            port: 4000,
            public_port: 4000,
            byoc: false,
            disable_access_log: false,
            enable_upnp: false,
            storage: StorageKind::File,
            storage_options: StorageOptions::default(),
            cache_dir: PathBuf::from("./cache"),
            ssl_cert: None,
            ssl_key: None,
            bmclapi,
            log_level: tracing::Level::INFO,
            log_dir: None,
        }
    }

    pub fn flavor(&self) -> Flavor {
        Flavor {
            runtime: common::version::runtime_flavor(),
            storage: self.storage.to_string(),
        }
    }
}

impl TryFrom<Args> for ClusterConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.cluster_id.trim().is_empty() {
            return Err(ConfigError::Missing("CLUSTER_ID"));
        }
        if args.cluster_secret.trim().is_empty() {
            return Err(ConfigError::Missing("CLUSTER_SECRET"));
        }

        let storage = args.cluster_storage.parse()?;
        let storage_options = StorageOptions::from_json(&args.cluster_storage_options)
            .map_err(ConfigError::StorageOptions)?;
        let bmclapi = Url::parse(args.cluster_bmclapi.trim_end_matches('/'))?;

        Ok(Self {
            cluster_id: args.cluster_id,
            cluster_secret: args.cluster_secret,
            cluster_ip: args.cluster_ip.filter(|ip| !ip.trim().is_empty()),
            port: args.cluster_port,
            public_port: args.cluster_public_port.unwrap_or(args.cluster_port),
            byoc: args.cluster_byoc,
            disable_access_log: args.disable_access_log,
            enable_upnp: args.enable_upnp,
            storage,
            storage_options,
            cache_dir: args.cache_dir,
            ssl_cert: args.ssl_cert.filter(|v| !v.trim().is_empty()),
            ssl_key: args.ssl_key.filter(|v| !v.trim().is_empty()),
            bmclapi,
            log_level: args.log_level,
            log_dir: args.log_dir,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid storage: {0}")]
    Storage(#[from] storage::prelude::StorageError),
    #[error("CLUSTER_STORAGE_OPTIONS is not a JSON object of strings: {0}")]
    StorageOptions(serde_json::Error),
    #[error("invalid coordinator url: {0}")]
    Url(#[from] url::ParseError),
}
