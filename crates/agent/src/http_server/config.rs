use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct Config {
    // Listen address
    pub listen_addr: SocketAddr,
    // log level for http tracing
    pub log_level: tracing::Level,
    // request/response tracing on or off
    pub access_log: bool,
}

impl Config {
    pub fn new(listen_addr: SocketAddr, access_log: bool) -> Self {
        tracing::info!(
            "Creating HTTP server Config: listen_addr={}, access_log={}",
            listen_addr,
            access_log
        );
        Self {
            listen_addr,
            log_level: tracing::Level::INFO,
            access_log,
        }
    }
}
