use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_kcp::{KcpConfig, KcpListener};

use crate::burrow::net;
use crate::burrow::tunnel::transport::{RawConnection, Transport, TransportListener};

/// UDP transport implemented as KCP (reliable UDP).
///
/// Each KCP conversation is surfaced as one raw connection; multiplexing is
/// layered on later, after the handshake.
pub struct UdpTransport {
    kcp: KcpConfig,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            kcp: KcpConfig::default(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr: SocketAddr = net::normalize_bind_addr(addr).parse()?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr).await?;
        let local = ln.local_addr().ok();
        Ok(Box::new(UdpTransportListener {
            ln: Mutex::new(ln),
            local,
        }))
    }
}

pub struct UdpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
}

#[async_trait]
impl TransportListener for UdpTransportListener {
    async fn accept(&self) -> anyhow::Result<RawConnection> {
        let mut ln = self.ln.lock().await;
        let (c, peer) = ln.accept().await?;
        Ok(RawConnection {
            stream: Box::new(c),
            remote: Some(peer),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
