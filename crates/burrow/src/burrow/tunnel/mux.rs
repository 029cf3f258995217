use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};

use crate::burrow::tunnel::transport::BoxedStream;

/// Per-stream receive window cap for every multiplexed session.
pub const MAX_RECEIVE_BUFFER: u32 = 419_430;

/// Inbound streams a control session accepts: the control stream itself.
pub const CONTROL_STREAMS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("mux: open stream: {0}")]
    Open(String),
    #[error("mux: session closed")]
    Closed,
}

/// Buffered bytes a peer can pin on one session are bounded by
/// `max_inbound * MAX_RECEIVE_BUFFER`. Streams the server opens itself are
/// capped by the pipe pool instead.
pub fn session_config(max_inbound: usize) -> tokio_yamux::Config {
    tokio_yamux::Config {
        max_stream_window_size: MAX_RECEIVE_BUFFER,
        max_stream_count: max_inbound.max(1),
        ..tokio_yamux::Config::default()
    }
}

/// A yamux session over an already secured byte stream.
///
/// The session future is driven by a background task that forwards inbound
/// streams into a channel; dropping the handle tears the connection down.
pub struct MuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl MuxSession {
    pub fn server(io: BoxedStream, remote: Option<SocketAddr>, max_inbound: usize) -> Self {
        let session = tokio_yamux::Session::new_server(io, session_config(max_inbound));
        Self::from_session(session, remote)
    }

    #[cfg(test)]
    pub fn client(io: BoxedStream, remote: Option<SocketAddr>) -> Self {
        let config = tokio_yamux::Config {
            max_stream_window_size: MAX_RECEIVE_BUFFER,
            ..tokio_yamux::Config::default()
        };
        let session = tokio_yamux::Session::new_client(io, config);
        Self::from_session(session, remote)
    }

    fn from_session(
        mut session: tokio_yamux::Session<BoxedStream>,
        remote: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "mux: session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            remote,
            task,
        }
    }

    pub async fn open_stream(&self) -> Result<BoxedStream, MuxError> {
        if self.task.is_finished() {
            return Err(MuxError::Closed);
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl
            .open_stream()
            .await
            .map_err(|e| MuxError::Open(e.to_string()))?;
        Ok(Box::new(st))
    }

    pub async fn accept_stream(&self) -> Result<BoxedStream, MuxError> {
        let mut rx = self.incoming.lock().await;
        let st = rx.recv().await.ok_or(MuxError::Closed)?;
        Ok(Box::new(st))
    }

    pub async fn close(&self) {
        {
            let mut ctrl = self.control.lock().await;
            ctrl.close().await;
        }
        self.task.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
