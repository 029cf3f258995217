use std::{sync::Arc, time::Duration};

use crate::burrow::{
    net::within,
    tunnel::{
        auth::{Authenticator, Notifier},
        control::{self, ControlError, PublicEndpoints, SessionParams},
        mux::{self, MuxError, MuxSession},
        pipe::{self, PipeError},
        pool::PoolLimits,
        protocol::{self, ClientHello, ErrorBody, HandshakeMessage, ProtocolError},
        registry::Registry,
        secure::{EncryptMode, NegotiateError, Negotiator},
        transport::{RawConnection, transport_by_name},
    },
};

/// Everything a control or pipe connection needs, shared by all listeners.
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub negotiator: Negotiator,
    pub limits: PoolLimits,
    pub endpoints: PublicEndpoints,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub notifier: Option<Notifier>,
    pub handshake_timeout: Duration,
    pub control_idle_timeout: Duration,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("negotiator", &self.negotiator)
            .field("limits", &self.limits)
            .field("endpoints", &self.endpoints)
            .field("auth", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handshake: timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("handshake: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("handshake: {0}")]
    Negotiate(#[from] NegotiateError),
    #[error("handshake: {0}")]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
}

/// Control/pipe listener for one transport.
pub struct Server {
    opts: ServerOptions,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(opts: ServerOptions, state: Arc<ServerState>) -> Self {
        Self { opts, state }
    }

    pub async fn listen_and_serve(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr.listen(&self.opts.listen_addr).await?;

        tracing::info!(
            addr = %self.opts.listen_addr,
            local_addr = ?ln.local_addr(),
            transport = %tr.name(),
            "tunnel: listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                conn = ln.accept() => {
                    let conn = match conn {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(err = %err, transport = %tr.name(), "tunnel: accept failed");
                            continue;
                        }
                    };
                    metrics::counter!("burrow_tunnel_connections_total", "transport" => tr.name()).increment(1);
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote;
                        if let Err(err) = handle_conn(state, conn).await {
                            tracing::warn!(remote = ?remote, err = %err, "tunnel: connection ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Reads the first handshake message and routes the connection to control
/// session or pipe establishment.
pub async fn handle_conn(
    state: Arc<ServerState>,
    mut raw: RawConnection,
) -> Result<(), DispatchError> {
    let msg: HandshakeMessage = within(state.handshake_timeout, protocol::read_message(&mut raw.stream))
        .await
        .ok_or(DispatchError::Timeout("first message"))??;

    match msg {
        HandshakeMessage::ClientHello(hello) => serve_client(state, raw, hello).await,
        HandshakeMessage::PipeClientHello(hello) => Ok(pipe::handle(state, raw, hello).await?),
        other => {
            tracing::warn!(remote = ?raw.remote, kind = other.kind(), "tunnel: unexpected handshake message");
            Ok(())
        }
    }
}

async fn serve_client(
    state: Arc<ServerState>,
    mut raw: RawConnection,
    hello: ClientHello,
) -> Result<(), DispatchError> {
    let mode = match hello
        .encrypt_mode
        .parse::<EncryptMode>()
        .and_then(|m| state.negotiator.check(m).map(|_| m))
    {
        Ok(mode) => mode,
        Err(err) => {
            let reply = HandshakeMessage::Error(ErrorBody::new(err.to_string()));
            let _ = protocol::write_message(&mut raw.stream, &reply).await;
            return Err(err.into());
        }
    };

    // Cleartext ack; the encryption handshake follows on the same bytes.
    protocol::write_message(&mut raw.stream, &HandshakeMessage::ServerHello).await?;

    let secured = state
        .negotiator
        .accept(raw.stream, mode, hello.enable_compress)
        .await?;
    let mux = Arc::new(MuxSession::server(secured, raw.remote, mux::CONTROL_STREAMS));
    let stream = within(state.handshake_timeout, mux.accept_stream())
        .await
        .ok_or(DispatchError::Timeout("control stream"))??;

    let params = SessionParams {
        mode,
        compress: hello.enable_compress,
        version: hello.version,
    };
    control::run(state, mux, stream, params).await?;
    Ok(())
}
