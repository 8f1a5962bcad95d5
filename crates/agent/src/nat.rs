//! Optional UPnP port mapping so the node is reachable from outside.

use std::fmt::{self, Debug};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use igd_next::aio::tokio::Tokio;
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

pub const MAPPING_LEASE: Duration = Duration::from_secs(3600);
pub const MAPPING_DESCRIPTION: &str = "openbmclapi";

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("no UPnP gateway found: {0}")]
    Search(String),
    #[error("port mapping failed: {0}")]
    Mapping(String),
    #[error("failed to query external address: {0}")]
    ExternalIp(String),
    #[error("gateway reported a non-public external address {0}")]
    NotPublic(IpAddr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live port-mapping lease, released with [`NatMapper::unmap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingHandle {
    pub public_port: u16,
    pub local_addr: SocketAddr,
    pub external_ip: Ipv4Addr,
}

#[async_trait]
pub trait NatMapper: Debug + Send + Sync {
    /// Forward `public_port` on the gateway to `local_port` on this host.
    async fn map(
        &self,
        local_port: u16,
        public_port: u16,
        lease: Duration,
        description: &str,
    ) -> Result<SocketAddr, NatError>;

    async fn unmap(&self, public_port: u16) -> Result<(), NatError>;

    async fn external_ip(&self) -> Result<IpAddr, NatError>;
}

/// Only a routable IPv4 address can be announced.
pub fn public_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4)
            if !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()) =>
        {
            Some(v4)
        }
        _ => None,
    }
}

/// UPnP IGD implementation.
#[derive(Default)]
pub struct UpnpNatMapper {
    gateway: OnceCell<Gateway<Tokio>>,
}

impl fmt::Debug for UpnpNatMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpnpNatMapper")
            .field("gateway", &self.gateway.get().map(|g| g.addr))
            .finish()
    }
}

impl UpnpNatMapper {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gateway(&self) -> Result<&Gateway<Tokio>, NatError> {
        self.gateway
            .get_or_try_init(|| async {
                let gateway = igd_next::aio::tokio::search_gateway(SearchOptions::default())
                    .await
                    .map_err(|e| NatError::Search(e.to_string()))?;
                tracing::info!(gateway = %gateway.addr, "found UPnP gateway");
                Ok::<_, NatError>(gateway)
            })
            .await
    }

    /// The address of this host on the interface that routes to the gateway.
    async fn local_ip(gateway: SocketAddr) -> Result<IpAddr, NatError> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(gateway).await?;
        Ok(socket.local_addr()?.ip())
    }
}

#[async_trait]
impl NatMapper for UpnpNatMapper {
    async fn map(
        &self,
        local_port: u16,
        public_port: u16,
        lease: Duration,
        description: &str,
    ) -> Result<SocketAddr, NatError> {
        let gateway = self.gateway().await?;
        let local_addr = SocketAddr::new(Self::local_ip(gateway.addr).await?, local_port);
        let lease_secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                public_port,
                local_addr,
                lease_secs,
                description,
            )
            .await
            .map_err(|e| NatError::Mapping(e.to_string()))?;
        Ok(local_addr)
    }

    async fn unmap(&self, public_port: u16) -> Result<(), NatError> {
        let gateway = self.gateway().await?;
        gateway
            .remove_port(PortMappingProtocol::TCP, public_port)
            .await
            .map_err(|e| NatError::Mapping(e.to_string()))
    }

    async fn external_ip(&self) -> Result<IpAddr, NatError> {
        let gateway = self.gateway().await?;
        gateway
            .get_external_ip()
            .await
            .map_err(|e| NatError::ExternalIp(e.to_string()))
    }
}

/// Owns the mapping lease for the lifetime of the process.
#[derive(Debug)]
pub struct NatService {
    enabled: bool,
    local_port: u16,
    public_port: u16,
    mapper: Box<dyn NatMapper>,
    handle: tokio::sync::Mutex<Option<MappingHandle>>,
    external: Mutex<Option<Ipv4Addr>>,
}

impl NatService {
    pub fn new(enabled: bool, local_port: u16, public_port: u16, mapper: Box<dyn NatMapper>) -> Self {
        Self {
            enabled,
            local_port,
            public_port,
            mapper,
            handle: tokio::sync::Mutex::new(None),
            external: Mutex::new(None),
        }
    }

    /// A service that never maps anything.
    pub fn disabled() -> Self {
        Self::new(false, 0, 0, Box::new(UpnpNatMapper::new()))
    }

    /// Map the public port when UPnP is enabled and return the external
    /// address. Repeated calls reuse the existing lease.
    pub async fn start_if_enabled(&self) -> Result<Option<Ipv4Addr>, NatError> {
        if !self.enabled {
            return Ok(None);
        }

        let mut handle = self.handle.lock().await;
        if let Some(existing) = handle.as_ref() {
            return Ok(Some(existing.external_ip));
        }

        let local_addr = self
            .mapper
            .map(
                self.local_port,
                self.public_port,
                MAPPING_LEASE,
                MAPPING_DESCRIPTION,
            )
            .await?;
        let ip = self.mapper.external_ip().await?;
        let Some(external_ip) = public_ipv4(ip) else {
            if let Err(e) = self.mapper.unmap(self.public_port).await {
                tracing::warn!(error = %e, "failed to release rejected mapping");
            }
            return Err(NatError::NotPublic(ip));
        };

        tracing::info!(
            local = %local_addr,
            public_port = self.public_port,
            external_ip = %external_ip,
            "UPnP port mapping established"
        );
        *handle = Some(MappingHandle {
            public_port: self.public_port,
            local_addr,
            external_ip,
        });
        *self.external.lock() = Some(external_ip);
        Ok(Some(external_ip))
    }

    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        *self.external.lock()
    }

    /// Release the lease, if any.
    pub async fn stop(&self) {
        let Some(mapping) = self.handle.lock().await.take() else {
            return;
        };
        self.external.lock().take();
        match self.mapper.unmap(mapping.public_port).await {
            Ok(()) => tracing::info!(public_port = mapping.public_port, "UPnP port mapping removed"),
            Err(e) => tracing::warn!(error = %e, "failed to remove UPnP port mapping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug)]
    struct FakeMapper {
        external: IpAddr,
        maps: Arc<AtomicUsize>,
        unmaps: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NatMapper for FakeMapper {
        async fn map(
            &self,
            local_port: u16,
            _public_port: u16,
            lease: Duration,
            description: &str,
        ) -> Result<SocketAddr, NatError> {
            assert_eq!(lease, MAPPING_LEASE);
            assert_eq!(description, MAPPING_DESCRIPTION);
            self.maps.fetch_add(1, Ordering::SeqCst);
            Ok(SocketAddr::from(([192, 168, 1, 10], local_port)))
        }

        async fn unmap(&self, _public_port: u16) -> Result<(), NatError> {
            self.unmaps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn external_ip(&self) -> Result<IpAddr, NatError> {
            Ok(self.external)
        }
    }

    fn service(external: IpAddr) -> (NatService, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let maps = Arc::new(AtomicUsize::new(0));
        let unmaps = Arc::new(AtomicUsize::new(0));
        let mapper = FakeMapper {
            external,
            maps: maps.clone(),
            unmaps: unmaps.clone(),
        };
        (NatService::new(true, 4000, 14000, Box::new(mapper)), maps, unmaps)
    }

    #[test]
    fn test_public_ipv4() {
        assert_eq!(
            public_ipv4("203.0.113.9".parse().unwrap()),
            Some(Ipv4Addr::new(203, 0, 113, 9))
        );
        for rejected in ["0.0.0.0", "127.0.0.1", "10.1.2.3", "192.168.0.1", "224.0.0.1", "::1"] {
            assert_eq!(public_ipv4(rejected.parse().unwrap()), None, "{}", rejected);
        }
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        assert_eq!(NatService::disabled().start_if_enabled().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mapping_is_reused_and_released() {
        let (nat, maps, unmaps) = service("203.0.113.9".parse().unwrap());

        let ip = nat.start_if_enabled().await.unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(nat.start_if_enabled().await.unwrap(), ip);
        assert_eq!(maps.load(Ordering::SeqCst), 1);
        assert_eq!(nat.external_ip(), ip);

        nat.stop().await;
        nat.stop().await;
        assert_eq!(unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(nat.external_ip(), None);
    }

    #[tokio::test]
    async fn test_private_external_address_is_rejected() {
        let (nat, _, unmaps) = service("192.168.1.1".parse().unwrap());
        assert!(matches!(
            nat.start_if_enabled().await,
            Err(NatError::NotPublic(_))
        ));
        assert_eq!(unmaps.load(Ordering::SeqCst), 1);
        assert_eq!(nat.external_ip(), None);
    }
}
