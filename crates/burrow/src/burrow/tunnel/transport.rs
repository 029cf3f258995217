use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// An accepted connection before any handshake has been read from it.
pub struct RawConnection {
    pub stream: BoxedStream,
    pub remote: Option<SocketAddr>,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<RawConnection>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "udp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|udp)"),
    }
}

pub mod tcp;
pub mod udp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "udp" => Ok(Arc::new(udp::UdpTransport::new())),
        _ => unreachable!(),
    }
}
