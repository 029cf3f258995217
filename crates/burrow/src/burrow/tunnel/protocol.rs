//! Wire messages exchanged with tunnel clients.
//!
//! Every message is one frame: a version byte, a big-endian `u32` body length
//! and a JSON body. Handshake messages travel on the raw connection before any
//! encryption; control messages travel on the control stream afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::burrow::tunnel::ClientId;

const PROTOCOL_V1: u8 = 1;
const MAGIC_WORK_STREAM: &[u8; 4] = b"BRWS";

pub const MAX_MESSAGE_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[cfg(test)]
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("empty tunnel name")]
    EmptyName,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// First message on every raw control-listener connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello,
    PipeClientHello(PipeClientHello),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Kept as text so an unknown mode still decodes and can be answered.
    pub encrypt_mode: String,
    #[serde(default)]
    pub enable_compress: bool,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeClientHello {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
}

impl ErrorBody {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

/// Messages carried on the control stream once the session is multiplexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ControlMessage {
    ControlClientHello(ControlClientHello),
    ControlServerHello(ControlServerHello),
    AddTunnels(AddTunnels),
    TunnelsAdded(TunnelsAdded),
    Ping,
    Pong,
    Error(ErrorBody),
}

impl HandshakeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "ClientHello",
            Self::ServerHello => "ServerHello",
            Self::PipeClientHello(_) => "PipeClientHello",
            Self::Error(_) => "Error",
        }
    }
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ControlClientHello(_) => "ControlClientHello",
            Self::ControlServerHello(_) => "ControlServerHello",
            Self::AddTunnels(_) => "AddTunnels",
            Self::TunnelsAdded(_) => "TunnelsAdded",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Error(_) => "Error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlClientHello {
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlServerHello {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddTunnels {
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelSpec>,
}

/// Name → public address of every tunnel accepted in one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelsAdded {
    #[serde(default)]
    pub tunnels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default)]
    pub protocol: String, // http | https
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub subdomain: String,
    /// Address the client dials for this tunnel; the server only echoes it.
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub http_host_rewrite: String,
}

impl TunnelSpec {
    pub fn normalize(mut self) -> Self {
        self.protocol = self.protocol.trim().to_ascii_lowercase();
        if self.protocol.is_empty() {
            self.protocol = "http".into();
        }
        self.hostname = self.hostname.trim().trim_end_matches('.').to_ascii_lowercase();
        self.subdomain = self.subdomain.trim().trim_matches('.').to_ascii_lowercase();
        self.local_addr = self.local_addr.trim().to_string();
        self.http_host_rewrite = self.http_host_rewrite.trim().to_string();
        self
    }
}

pub async fn write_message<W, M>(w: &mut W, msg: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let b = serde_json::to_vec(msg)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut frame = Vec::with_capacity(5 + b.len());
    frame.push(PROTOCOL_V1);
    frame.extend_from_slice(&n.to_be_bytes());
    frame.extend_from_slice(&b);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Reads exactly one frame; never consumes bytes past it, so the caller can
/// start a TLS or AES handshake on the same stream right after.
pub async fn read_message<R, M>(r: &mut R) -> Result<M, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let n = r.read_u32().await?;
    if n > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Prefix written by the server on every work stream it opens on a pipe, so
/// the client knows which local service to dial.
pub async fn write_work_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    tunnel: &str,
) -> Result<(), ProtocolError> {
    let tunnel = tunnel.trim();
    if tunnel.is_empty() {
        return Err(ProtocolError::EmptyName);
    }
    let b = tunnel.as_bytes();
    let n: u16 = b
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(b.len() as u32))?;

    let mut hdr = Vec::with_capacity(7 + b.len());
    hdr.extend_from_slice(MAGIC_WORK_STREAM);
    hdr.push(PROTOCOL_V1);
    hdr.extend_from_slice(&n.to_be_bytes());
    hdr.extend_from_slice(b);
    w.write_all(&hdr).await?;
    Ok(())
}

#[cfg(test)]
pub async fn read_work_stream_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<String, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_WORK_STREAM {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    let n = r.read_u16().await?;
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    let name = String::from_utf8_lossy(&buf).trim().to_string();
    if name.is_empty() {
        return Err(ProtocolError::EmptyName);
    }
    Ok(name)
}
