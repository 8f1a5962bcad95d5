/**
 * Startup sequence, manifest recheck
 *  loop and ordered shutdown.
 */
pub mod bootstrap;
/**
 * TLS certificate resolution: provided
 *  material or issued by the coordinator.
 */
pub mod cert;
/**
 * HTTP client for the coordinator's
 *  plain REST endpoints.
 */
pub mod client;
/**
 * Cluster state machine (connect, enable,
 *  disable) and the sync pipeline.
 */
pub mod cluster;
pub mod config;
/**
 * Socket.IO control-plane connection.
 */
pub mod control;
pub mod http_server;
/**
 * Periodic keep-alive reporting with
 *  kick detection and reconnect.
 */
pub mod keepalive;
pub mod nat;
pub mod process;
pub mod task;
/**
 * Challenge-response token acquisition
 *  and renewal.
 */
pub mod token;

pub use config::{Args, ClusterConfig};
pub use process::{spawn_service, start_service, ShutdownHandle};

pub mod prelude {
    pub use crate::bootstrap::{BootstrapError, BootstrapService};
    pub use crate::client::{ApiError, CoordinatorClient};
    pub use crate::cluster::{ClusterControl, ClusterError, ClusterService, SyncError};
    pub use crate::config::{ClusterConfig, ConfigError};
    pub use crate::control::{Ack, ControlConnection, ControlError};
    pub use crate::keepalive::{KeepaliveOutcome, KeepaliveService};
    pub use crate::nat::{NatError, NatMapper, NatService};
    pub use crate::token::{TokenError, TokenManager};
}
