use std::sync::Arc;

use crate::burrow::tunnel::{
    ClientId,
    mux::MuxSession,
    pool::PoolError,
    protocol::PipeClientHello,
    secure::NegotiateError,
    server::ServerState,
    transport::RawConnection,
};

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("pipe: unknown client {0}")]
    UnknownClient(ClientId),
    #[error("pipe: {0}")]
    Negotiate(#[from] NegotiateError),
    #[error("pipe: {0}")]
    Pool(#[from] PoolError),
}

/// Attaches a pipe connection to the control session named in its hello and
/// holds it until either side closes it.
///
/// Unknown ids are rejected without a reply. The pipe inherits the session's
/// encryption mode and compression flag.
pub async fn handle(
    state: Arc<ServerState>,
    raw: RawConnection,
    hello: PipeClientHello,
) -> Result<(), PipeError> {
    let session = state
        .registry
        .session(&hello.client_id)
        .await
        .ok_or(PipeError::UnknownClient(hello.client_id))?;

    let secured = state
        .negotiator
        .accept(raw.stream, session.mode(), session.compress())
        .await?;
    let mux = Arc::new(MuxSession::server(
        secured,
        raw.remote,
        session.pool().limits().max_streams,
    ));

    let id = match session.pool().add(mux.clone()) {
        Ok(id) => id,
        Err(err) => {
            mux.close().await;
            return Err(err.into());
        }
    };
    tracing::debug!(
        client_id = %session.id(),
        pipe = %id,
        remote = ?raw.remote,
        "pipe: attached"
    );

    // Work streams are opened by us; anything the client opens is dropped.
    while let Ok(_st) = mux.accept_stream().await {}

    session.pool().remove(id);
    tracing::debug!(client_id = %session.id(), pipe = %id, "pipe: detached");
    Ok(())
}
