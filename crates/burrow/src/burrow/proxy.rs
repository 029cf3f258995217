//! Relays an external connection over a work stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::burrow::{
    telemetry,
    tunnel::{control::AllocError, registry::Tunnel},
};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy: no work stream: {0}")]
    Alloc(#[from] AllocError),
    #[error("proxy: copy: {0}")]
    Io(#[from] std::io::Error),
}

const RELAY_BUF: usize = 16 * 1024;

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("burrow_proxy_connections_total").increment(1);
        metrics::gauge!("burrow_proxy_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("burrow_proxy_active_connections").decrement(1.0);
    }
}

/// Copies `r` into `w` until EOF, counting bytes as they are handed to `w`.
async fn relay<R, W>(r: &mut R, w: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        *total += n as u64;
        w.flush().await?;
    }
}

/// Allocates a work stream from the tunnel's session and copies bytes both
/// ways until either direction ends, then shuts both sides down. The work
/// stream's lease is released before returning.
///
/// Returns `(ingress, egress)` byte counts as seen from the external side.
pub async fn pump<S>(
    external: S,
    tunnel: &Tunnel,
    client: String,
    conns: &telemetry::SharedConns,
) -> Result<(u64, u64), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _active = ActiveConnGuard::new();
    let work = match tunnel.session.allocate_work_stream(&tunnel.name).await {
        Ok(w) => w,
        Err(err) => {
            metrics::counter!("burrow_proxy_alloc_failures_total").increment(1);
            let mut external = external;
            let _ = external.shutdown().await;
            return Err(err.into());
        }
    };

    let id = telemetry::new_conn_id();
    conns.add(telemetry::ConnInfo {
        id: id.clone(),
        client,
        public_addr: tunnel.public_addr.clone(),
        tunnel: tunnel.name.clone(),
        client_id: tunnel.session.id().to_string(),
        pipe: work.pipe_id().to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(
            conn = %id,
            tunnel = %tunnel.name,
            pipe = %work.pipe_id(),
            active = conns.len(),
            "proxy: relaying"
        );
    }

    let (mut ext_r, mut ext_w) = tokio::io::split(external);
    let (mut work_r, mut work_w) = tokio::io::split(work);
    let (mut ingress, mut egress) = (0u64, 0u64);
    let res = tokio::select! {
        r = relay(&mut ext_r, &mut work_w, &mut ingress) => r,
        r = relay(&mut work_r, &mut ext_w, &mut egress) => r,
    };
    let _ = work_w.shutdown().await;
    let _ = ext_w.shutdown().await;
    drop((work_r, work_w));
    conns.remove(&id);

    res?;
    metrics::counter!("burrow_bytes_ingress_total").increment(ingress);
    metrics::counter!("burrow_bytes_egress_total").increment(egress);
    Ok((ingress, egress))
}
