use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::burrow::net;
use crate::burrow::tunnel::transport::{RawConnection, Transport, TransportListener};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<RawConnection> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(RawConnection {
            stream: Box::new(c),
            remote: Some(peer),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn accepted_connection_carries_bytes_and_peer() {
        let ln = TcpTransport::new().listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
            c.write_all(b"ping").await.unwrap();
            c.local_addr().unwrap()
        });

        let mut raw = ln.accept().await.unwrap();
        let mut buf = [0u8; 4];
        raw.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(raw.remote, Some(client.await.unwrap()));
    }
}
