//! Public HTTP/HTTPS listeners that route by virtual host.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

use crate::burrow::{
    net, proxy, telemetry,
    tunnel::registry::{self, Registry},
};

pub mod sniff;

use sniff::{HostParser, HttpHostParser, PrefixedStream, SniffError, TlsSniParser};

const BAD_GATEWAY_BODY: &str =
    "<html><head><title>502 Bad Gateway</title></head><body><h1>502 Bad Gateway</h1><p>No tunnel is registered for this host.</p></body></html>";

/// The fixed response for hosts without a tunnel.
pub fn bad_gateway_response() -> String {
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{BAD_GATEWAY_BODY}",
        BAD_GATEWAY_BODY.len()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

pub struct VhostOptions {
    pub registry: Arc<Registry>,
    /// Terminates TLS on the HTTPS listener.
    pub tls: Option<TlsAcceptor>,
    /// Bounds host sniffing (and the TLS handshake on HTTPS).
    pub sniff_timeout: Duration,
    pub max_header_bytes: usize,
    pub conns: telemetry::SharedConns,
}

pub struct VhostListener {
    scheme: Scheme,
    public_port: u16,
    ln: TcpListener,
    opts: Arc<VhostOptions>,
}

impl VhostListener {
    /// Binds `listen_addr`. Lookups use `public_port` when given, otherwise
    /// the port actually bound.
    pub async fn bind(
        listen_addr: &str,
        scheme: Scheme,
        public_port: Option<u16>,
        opts: Arc<VhostOptions>,
    ) -> anyhow::Result<Self> {
        if scheme == Scheme::Https && opts.tls.is_none() {
            anyhow::bail!("vhost: https listener requires a tls certificate");
        }
        let bind_addr = net::normalize_bind_addr(listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind {} {listen_addr}", scheme.as_str()))?;
        let public_port = match public_port {
            Some(p) => p,
            None => ln.local_addr()?.port(),
        };
        Ok(Self {
            scheme,
            public_port,
            ln,
            opts,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.ln.local_addr()
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            scheme = self.scheme.as_str(),
            public_port = self.public_port(),
            "vhost: listening"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "vhost: accept failed");
                            continue;
                        }
                    };
                    let opts = self.opts.clone();
                    let (scheme, port) = (self.scheme, self.public_port);
                    tokio::spawn(async move {
                        match scheme {
                            Scheme::Http => handle_http(conn, peer, port, opts).await,
                            Scheme::Https => handle_https(conn, peer, port, opts).await,
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn sniff_host(
    conn: &mut TcpStream,
    parser: &dyn HostParser,
    opts: &VhostOptions,
) -> Result<sniff::Sniffed, SniffError> {
    net::within(
        opts.sniff_timeout,
        sniff::sniff(conn, parser, opts.max_header_bytes),
    )
    .await
    .ok_or(SniffError::Timeout)?
}

async fn write_bad_gateway<S: AsyncWrite + Unpin>(conn: &mut S) -> std::io::Result<()> {
    conn.write_all(bad_gateway_response().as_bytes()).await?;
    conn.shutdown().await
}

async fn relay<S>(external: S, tunnel: &registry::Tunnel, peer: SocketAddr, opts: &VhostOptions)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy::pump(external, tunnel, peer.to_string(), &opts.conns).await {
        Ok((ingress, egress)) => tracing::debug!(
            client = %peer,
            tunnel = %tunnel.public_addr,
            ingress,
            egress,
            "vhost: connection finished"
        ),
        Err(err) => tracing::debug!(client = %peer, tunnel = %tunnel.public_addr, err = %err, "vhost: relay failed"),
    }
}

async fn handle_http(mut conn: TcpStream, peer: SocketAddr, port: u16, opts: Arc<VhostOptions>) {
    let sniffed = match sniff_host(&mut conn, &HttpHostParser, &opts).await {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "vhost: http sniff failed");
            return;
        }
    };

    let addr = registry::public_addr(Scheme::Http.as_str(), &sniffed.host, port);
    let Some(tunnel) = opts.registry.lookup(&addr).await else {
        tracing::debug!(client = %peer, addr = %addr, "vhost: no tunnel");
        metrics::counter!("burrow_vhost_misses_total", "scheme" => "http").increment(1);
        let _ = write_bad_gateway(&mut conn).await;
        return;
    };

    let mut prelude = sniffed.prelude;
    let rewrite = tunnel.spec.http_host_rewrite.as_str();
    if !rewrite.is_empty() {
        match sniff::rewrite_http_host(&prelude, rewrite) {
            Some(p) => prelude = p,
            None => {
                tracing::warn!(client = %peer, addr = %addr, "vhost: host rewrite failed");
                return;
            }
        }
    }

    relay(PrefixedStream::new(prelude, conn), &tunnel, peer, &opts).await;
}

async fn handle_https(mut conn: TcpStream, peer: SocketAddr, port: u16, opts: Arc<VhostOptions>) {
    let Some(acceptor) = opts.tls.clone() else {
        return;
    };
    let sniffed = match sniff_host(&mut conn, &TlsSniParser, &opts).await {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "vhost: tls sniff failed");
            return;
        }
    };

    let addr = registry::public_addr(Scheme::Https.as_str(), &sniffed.host, port);
    let tunnel = opts.registry.lookup(&addr).await;
    let replay = PrefixedStream::new(sniffed.prelude, conn);
    let mut tls = match net::within(opts.sniff_timeout, acceptor.accept(replay)).await {
        Some(Ok(tls)) => tls,
        Some(Err(err)) => {
            tracing::debug!(client = %peer, err = %err, "vhost: tls handshake failed");
            return;
        }
        None => {
            tracing::debug!(client = %peer, "vhost: tls handshake timed out");
            return;
        }
    };

    match tunnel {
        Some(tunnel) => relay(tls, &tunnel, peer, &opts).await,
        None => {
            tracing::debug!(client = %peer, addr = %addr, "vhost: no tunnel");
            metrics::counter!("burrow_vhost_misses_total", "scheme" => "https").increment(1);
            let _ = write_bad_gateway(&mut tls).await;
        }
    }
}
