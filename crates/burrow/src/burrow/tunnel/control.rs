//! Control sessions: handshake, serve loop, teardown, and work-stream
//! allocation over the session's pipe pool.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::burrow::{
    net::within,
    tunnel::{
        ClientId,
        auth::{AuthError, SessionEvent},
        mux::MuxSession,
        pool::{Lease, PipePool, PoolError, PoolLimits, PoolStats, WorkStream},
        protocol::{
            self, AddTunnels, ControlMessage, ControlServerHello, ErrorBody, ProtocolError,
            TunnelSpec, TunnelsAdded,
        },
        registry::{self, RegistryError, TunnelRequest},
        secure::EncryptMode,
        server::ServerState,
        transport::BoxedStream,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control: timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("control: authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("control: {0}")]
    Registry(#[from] RegistryError),
    #[error("control: {0}")]
    BadTunnel(String),
    #[error("control: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("work stream header: {0}")]
    Header(#[from] ProtocolError),
}

/// What the client asked for in its `ClientHello`; pipes reuse it.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub mode: EncryptMode,
    pub compress: bool,
    pub version: String,
}

/// Where public tunnels are exposed.
#[derive(Debug, Clone, Default)]
pub struct PublicEndpoints {
    pub server_domain: String,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
}

pub struct Session {
    id: ClientId,
    params: SessionParams,
    mux: Arc<MuxSession>,
    pool: Arc<PipePool>,
    started: Instant,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.params.mode)
            .field("compress", &self.params.compress)
            .field("remote", &self.mux.remote_addr())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: ClientId, params: SessionParams, mux: Arc<MuxSession>, limits: PoolLimits) -> Self {
        Self {
            id,
            params,
            mux,
            pool: Arc::new(PipePool::new(limits)),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn mode(&self) -> EncryptMode {
        self.params.mode
    }

    pub fn compress(&self) -> bool {
        self.params.compress
    }

    pub fn version(&self) -> &str {
        &self.params.version
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.mux.remote_addr()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn pool(&self) -> &Arc<PipePool> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Opens a work stream for `tunnel` on any pipe with spare capacity.
    ///
    /// Fails immediately when the pool is exhausted; pipes that fail to open
    /// a stream are dropped from the pool and the next candidate is tried.
    pub async fn allocate_work_stream(&self, tunnel: &str) -> Result<WorkStream, AllocError> {
        loop {
            let (id, pipe) = self.pool.acquire()?;
            let lease = Lease::new(self.pool.clone(), id);
            match pipe.open_stream().await {
                Ok(mut st) => {
                    protocol::write_work_stream_header(&mut st, tunnel).await?;
                    return Ok(WorkStream::new(st, lease));
                }
                Err(err) => {
                    tracing::debug!(client_id = %self.id, pipe = %id, err = %err, "control: dropping broken pipe");
                    self.pool.remove(id);
                    drop(lease);
                    pipe.close().await;
                }
            }
        }
    }
}

/// Computes the public address a tunnel is published at.
pub fn resolve_public_addr(
    name: &str,
    spec: &TunnelSpec,
    endpoints: &PublicEndpoints,
    client_id: ClientId,
) -> Result<String, ControlError> {
    let bad = |msg: String| ControlError::BadTunnel(format!("tunnel {name:?}: {msg}"));
    if name.trim().is_empty() {
        return Err(ControlError::BadTunnel("empty tunnel name".into()));
    }

    let (scheme, port) = match spec.protocol.as_str() {
        "http" => ("http", endpoints.http_port),
        "https" => ("https", endpoints.https_port),
        other => return Err(bad(format!("unsupported protocol {other:?}"))),
    };
    let port = port.ok_or_else(|| bad(format!("{scheme} is not enabled on this server")))?;

    let domain = endpoints.server_domain.trim().trim_matches('.');
    let host = if !spec.hostname.is_empty() {
        spec.hostname.clone()
    } else if domain.is_empty() {
        return Err(bad("hostname required (server has no domain)".into()));
    } else if !spec.subdomain.is_empty() {
        format!("{}.{domain}", spec.subdomain)
    } else {
        format!("{}-{}.{domain}", name.trim().to_ascii_lowercase(), client_id.short())
    };

    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid || host.starts_with('.') || host.len() > 253 {
        return Err(bad(format!("invalid hostname {host:?}")));
    }
    Ok(registry::public_addr(scheme, &host, port))
}

async fn read_within(
    stream: &mut BoxedStream,
    limit: Duration,
    what: &'static str,
) -> Result<ControlMessage, ControlError> {
    within(limit, protocol::read_message(stream))
        .await
        .ok_or(ControlError::Timeout(what))?
        .map_err(Into::into)
}

async fn reply_error(stream: &mut BoxedStream, msg: impl Into<String>) {
    let _ = protocol::write_message(stream, &ControlMessage::Error(ErrorBody::new(msg))).await;
}

/// Runs one control session to completion over its accepted control stream.
pub async fn run(
    state: Arc<ServerState>,
    mux: Arc<MuxSession>,
    mut stream: BoxedStream,
    params: SessionParams,
) -> Result<(), ControlError> {
    let msg = read_within(&mut stream, state.handshake_timeout, "ControlClientHello").await?;
    let token = match msg {
        ControlMessage::ControlClientHello(h) => h.auth_token,
        other => {
            return Err(ControlError::Unexpected {
                expected: "ControlClientHello",
                got: other.kind(),
            });
        }
    };

    if let Some(auth) = &state.authenticator {
        if let Err(err) = auth.authenticate(&token).await {
            reply_error(&mut stream, "authentication failed").await;
            mux.close().await;
            return Err(err.into());
        }
    }

    let session = Arc::new(Session::new(ClientId::new(), params, mux, state.limits));
    state.registry.insert_session(session.clone()).await?;
    metrics::gauge!("burrow_control_sessions").increment(1.0);

    let res = serve(&state, &session, &mut stream).await;
    teardown(&state, &session).await;
    res
}

async fn serve(
    state: &ServerState,
    session: &Arc<Session>,
    stream: &mut BoxedStream,
) -> Result<(), ControlError> {
    let hello = ControlMessage::ControlServerHello(ControlServerHello {
        client_id: session.id(),
    });
    protocol::write_message(stream, &hello).await?;

    let batch = match read_within(stream, state.handshake_timeout, "AddTunnels").await? {
        ControlMessage::AddTunnels(batch) => batch,
        other => {
            return Err(ControlError::Unexpected {
                expected: "AddTunnels",
                got: other.kind(),
            });
        }
    };
    let added = match register(state, session, batch).await {
        Ok(added) => added,
        Err(err) => {
            reply_error(stream, err.to_string()).await;
            return Err(err);
        }
    };
    let addrs: Vec<String> = added.values().cloned().collect();
    protocol::write_message(stream, &ControlMessage::TunnelsAdded(TunnelsAdded { tunnels: added }))
        .await?;

    tracing::info!(
        client_id = %session.id(),
        remote = ?session.remote_addr(),
        encrypt_mode = %session.mode(),
        compress = session.compress(),
        version = %session.version(),
        tunnels = ?addrs,
        "control: session established"
    );
    if let Some(n) = &state.notifier {
        n.notify(SessionEvent::SessionOpened, session.id(), addrs);
    }

    // The client never opens streams on the control session after the first
    // one; drain any so the mux driver is not blocked on them.
    let drain = {
        let mux = session.mux.clone();
        let id = session.id();
        tokio::spawn(async move {
            while let Ok(_st) = mux.accept_stream().await {
                tracing::debug!(client_id = %id, "control: dropping unexpected stream");
            }
        })
    };
    let res = serve_loop(state, session, stream).await;
    drain.abort();
    res
}

async fn serve_loop(
    state: &ServerState,
    session: &Arc<Session>,
    stream: &mut BoxedStream,
) -> Result<(), ControlError> {
    loop {
        let msg = match within(state.control_idle_timeout, protocol::read_message(stream)).await {
            None => return Err(ControlError::Timeout("control message")),
            Some(Ok(msg)) => msg,
            Some(Err(ProtocolError::Io(err)))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(());
            }
            Some(Err(err)) => return Err(err.into()),
        };

        match msg {
            ControlMessage::Ping => protocol::write_message(stream, &ControlMessage::Pong).await?,
            ControlMessage::AddTunnels(batch) => match register(state, session, batch).await {
                Ok(added) => {
                    tracing::info!(client_id = %session.id(), tunnels = ?added, "control: tunnels added");
                    let reply = ControlMessage::TunnelsAdded(TunnelsAdded { tunnels: added });
                    protocol::write_message(stream, &reply).await?;
                }
                Err(err) => {
                    tracing::warn!(client_id = %session.id(), err = %err, "control: tunnel batch rejected");
                    let reply = ControlMessage::Error(ErrorBody::new(err.to_string()));
                    protocol::write_message(stream, &reply).await?;
                }
            },
            other => {
                tracing::debug!(client_id = %session.id(), kind = other.kind(), "control: ignoring message");
            }
        }
    }
}

async fn register(
    state: &ServerState,
    session: &Session,
    batch: AddTunnels,
) -> Result<BTreeMap<String, String>, ControlError> {
    let mut reqs = Vec::with_capacity(batch.tunnels.len());
    let mut added = BTreeMap::new();
    for (name, spec) in batch.tunnels {
        let name = name.trim().to_string();
        let spec = spec.normalize();
        let addr = resolve_public_addr(&name, &spec, &state.endpoints, session.id())?;
        added.insert(name.clone(), addr.clone());
        reqs.push(TunnelRequest {
            name,
            public_addr: addr,
            spec,
        });
    }
    state.registry.register_tunnels(&session.id(), reqs).await?;
    Ok(added)
}

async fn teardown(state: &ServerState, session: &Arc<Session>) {
    let removed = state
        .registry
        .remove_session(&session.id())
        .await
        .map(|(_, addrs)| addrs)
        .unwrap_or_default();

    let pipes = session.pool.close();
    let pipe_count = pipes.len();
    for pipe in pipes {
        pipe.close().await;
    }
    session.mux.close().await;
    metrics::gauge!("burrow_control_sessions").decrement(1.0);

    tracing::info!(
        client_id = %session.id(),
        tunnels = ?removed,
        pipes = pipe_count,
        uptime = %humantime::format_duration(Duration::from_secs(session.uptime().as_secs())),
        "control: session closed"
    );
    if let Some(n) = &state.notifier {
        n.notify(SessionEvent::SessionClosed, session.id(), removed);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::burrow::tunnel::testkit;

    fn spec(protocol: &str, hostname: &str, subdomain: &str) -> TunnelSpec {
        TunnelSpec {
            protocol: protocol.into(),
            hostname: hostname.into(),
            subdomain: subdomain.into(),
            ..TunnelSpec::default()
        }
    }

    fn endpoints(domain: &str) -> PublicEndpoints {
        PublicEndpoints {
            server_domain: domain.into(),
            http_port: Some(80),
            https_port: None,
        }
    }

    #[test]
    fn public_addr_prefers_hostname_then_subdomain_then_name() {
        let id = ClientId::new();
        let ep = endpoints("tunnel.test");

        let a = resolve_public_addr("web", &spec("http", "a.example.com", "x"), &ep, id).unwrap();
        assert_eq!(a, "http://a.example.com:80");

        let b = resolve_public_addr("web", &spec("http", "", "api"), &ep, id).unwrap();
        assert_eq!(b, "http://api.tunnel.test:80");

        let c = resolve_public_addr("Web", &spec("http", "", ""), &ep, id).unwrap();
        assert_eq!(c, format!("http://web-{}.tunnel.test:80", id.short()));
    }

    #[test]
    fn public_addr_rejects_unusable_specs() {
        let id = ClientId::new();
        let ep = endpoints("");
        for (name, s) in [
            ("web", spec("tcp", "a.test", "")),
            ("web", spec("https", "a.test", "")),
            ("web", spec("http", "", "api")),
            ("web", spec("http", "bad host", "")),
            ("", spec("http", "a.test", "")),
        ] {
            assert!(
                matches!(resolve_public_addr(name, &s, &ep, id), Err(ControlError::BadTunnel(_))),
                "{name} {s:?}"
            );
        }
    }

    #[tokio::test]
    async fn allocation_fails_fast_without_pipes() {
        let (session, _peer) = testkit::detached_session();
        assert!(matches!(
            session.allocate_work_stream("web").await,
            Err(AllocError::Pool(PoolError::Exhausted))
        ));
    }

    #[tokio::test]
    async fn allocation_writes_header_and_respects_stream_cap() {
        let (session, _peer) = testkit::detached_session_with(PoolLimits {
            max_idle_pipes: 2,
            max_streams: 2,
        });
        let client_pipe = testkit::attach_local_pipe(&session);

        let first = session.allocate_work_stream("web").await.unwrap();
        let second = session.allocate_work_stream("web").await.unwrap();
        assert_eq!(first.pipe_id(), second.pipe_id());
        assert!(matches!(
            session.allocate_work_stream("web").await,
            Err(AllocError::Pool(PoolError::Exhausted))
        ));

        let mut inbound = client_pipe.accept_stream().await.unwrap();
        assert_eq!(protocol::read_work_stream_header(&mut inbound).await.unwrap(), "web");

        drop(first);
        let third = session.allocate_work_stream("api").await.unwrap();
        assert_eq!(third.pipe_id(), second.pipe_id());
        assert_eq!(session.pool_stats().streams, 2);
    }

    #[tokio::test]
    async fn broken_pipe_is_dropped_and_next_one_used() {
        let (session, _peer) = testkit::detached_session_with(PoolLimits {
            max_idle_pipes: 2,
            max_streams: 4,
        });
        let dead = testkit::attach_local_pipe(&session);
        let live = testkit::attach_local_pipe(&session);
        drop(dead);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ws = session.allocate_work_stream("web").await.unwrap();
        let mut inbound = live.accept_stream().await.unwrap();
        let mut magic = [0u8; 4];
        inbound.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"BRWS");
        assert_eq!(session.pool_stats().busy, 1);
        assert_eq!(session.pool_stats().idle, 0);
    }
}
