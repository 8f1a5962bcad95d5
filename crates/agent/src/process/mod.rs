pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::prelude::Counters;
use futures::future::join_all;
use storage::prelude::{create_storage, Storage};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::bootstrap::BootstrapService;
use crate::cert::CertificateService;
use crate::client::CoordinatorClient;
use crate::cluster::ClusterService;
use crate::config::ClusterConfig;
use crate::http_server;
use crate::keepalive::KeepaliveService;
use crate::nat::{NatService, UpnpNatMapper};
use crate::token::TokenManager;

/// Handle for gracefully shutting down the agent.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    http_tx: watch::Sender<()>,
    bootstrap: Arc<BootstrapService>,
    nat: Arc<NatService>,
    failed: bool,
}

impl ShutdownHandle {
    /// Block until the agent shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        let _ = self.graceful_waiter.await;
        tracing::info!("shutting down");

        self.bootstrap.shutdown().await;
        self.nat.stop().await;
        let _ = self.http_tx.send(());

        if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds",
                FINAL_SHUTDOWN_TIMEOUT.as_secs()
            );
            std::process::exit(4);
        }
        if self.failed {
            std::process::exit(1);
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(config: &ClusterConfig) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "bmclapi-agent.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Create the storage backend, exiting on error.
async fn create_backend(config: &ClusterConfig) -> Arc<dyn Storage> {
    let storage = match create_storage(config.storage, &config.storage_options, &config.cache_dir) {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!("error creating storage: {}", e);
            std::process::exit(3);
        }
    };
    if let Err(e) = storage.init().await {
        tracing::error!("error initializing storage: {}", e);
        std::process::exit(3);
    }
    storage
}

/// Wire every component, start serving and bootstrap the cluster.
///
/// The returned `ShutdownHandle` must be waited on; dropping it does not
/// stop the agent.
pub async fn start_service(config: ClusterConfig) -> ShutdownHandle {
    let (graceful_waiter, shutdown_tx, _) = match utils::graceful_shutdown_blocker() {
        Ok(blocker) => blocker,
        Err(e) => {
            tracing::error!("failed to install signal handlers: {}", e);
            std::process::exit(3);
        }
    };
    let config = Arc::new(config);

    let storage = create_backend(&config).await;
    let counters = Arc::new(Counters::new());

    let client = match CoordinatorClient::new(&config.bmclapi) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("error creating coordinator client: {}", e);
            std::process::exit(3);
        }
    };
    let tokens = Arc::new(TokenManager::new(
        config.cluster_id.clone(),
        config.cluster_secret.clone(),
        client.clone(),
    ));
    let nat = Arc::new(NatService::new(
        config.enable_upnp,
        config.port,
        config.public_port,
        Box::new(UpnpNatMapper::new()),
    ));
    let cluster = Arc::new(ClusterService::new(
        config.clone(),
        client,
        tokens.clone(),
        storage.clone(),
        nat.clone(),
    ));

    let tls = match CertificateService::new(config.clone(), cluster.clone())
        .setup()
        .await
    {
        Ok(tls) => tls,
        Err(e) => {
            tracing::error!("certificate setup failed, serving plain HTTP: {}", e);
            None
        }
    };

    let mut handles = Vec::new();

    // Spawn HTTP server
    let (http_tx, http_rx) = watch::channel(());
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let http_config = http_server::Config::new(listen_addr, !config.disable_access_log);
    let http_state = http_server::AppState::new(&config.cluster_secret, storage.clone(), counters.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server::run(http_config, http_state, http_rx, tls).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });
    handles.push(http_handle);

    let keepalive = Arc::new(
        KeepaliveService::new(cluster.clone(), counters).with_fatal_signal(shutdown_tx.clone()),
    );
    let bootstrap = Arc::new(BootstrapService::new(cluster, storage, tokens, keepalive));

    let mut handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
        http_tx,
        bootstrap: bootstrap.clone(),
        nat,
        failed: false,
    };

    match bootstrap.bootstrap().await {
        Ok(()) => tracing::info!(port = config.port, "agent is serving"),
        Err(e) => {
            tracing::error!("bootstrap failed: {}", e);
            handle.failed = true;
            handle.shutdown();
        }
    }

    handle
}

/// Runs the agent until a shutdown signal is received.
pub async fn spawn_service(config: ClusterConfig) {
    let _guards = init_logging(&config);
    let handle = start_service(config).await;
    handle.wait().await;
}
