//! Encryption-mode negotiation for control and pipe connections.

use std::{fmt, fs, path::Path, str::FromStr, sync::Arc};

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;

use crate::burrow::tunnel::{
    transform::{aes, deflate},
    transport::BoxedStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptMode {
    None,
    Tls,
    Aes,
}

impl EncryptMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptMode::None => "none",
            EncryptMode::Tls => "tls",
            EncryptMode::Aes => "aes",
        }
    }
}

impl fmt::Display for EncryptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptMode {
    type Err = NegotiateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(EncryptMode::None),
            "tls" => Ok(EncryptMode::Tls),
            "aes" => Ok(EncryptMode::Aes),
            _ => Err(NegotiateError::InvalidMode(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    #[error("invalid encryption mode {0:?}")]
    InvalidMode(String),
    #[error("server not support {0} mode")]
    Unsupported(EncryptMode),
    #[error("transform: tls handshake: {0}")]
    Tls(#[source] std::io::Error),
    #[error("transform: aes setup: {0}")]
    Aes(#[source] std::io::Error),
}

/// Turns raw connections into secured (and optionally compressed) streams
/// according to what the server was configured with.
#[derive(Clone, Default)]
pub struct Negotiator {
    tls: Option<TlsAcceptor>,
    secret: Option<Arc<[u8]>>,
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("tls", &self.tls.is_some())
            .field("aes", &self.secret.is_some())
            .finish()
    }
}

impl Negotiator {
    pub fn new(tls: Option<Arc<rustls::ServerConfig>>, secret: Option<&str>) -> Self {
        Self {
            tls: tls.map(TlsAcceptor::from),
            secret: secret
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Arc::from(s.as_bytes())),
        }
    }

    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn check(&self, mode: EncryptMode) -> Result<(), NegotiateError> {
        match mode {
            EncryptMode::None => Ok(()),
            EncryptMode::Tls if self.tls.is_some() => Ok(()),
            EncryptMode::Aes if self.secret.is_some() => Ok(()),
            other => Err(NegotiateError::Unsupported(other)),
        }
    }

    /// Applies the encryption layer for `mode`, then compression if requested.
    pub async fn accept(
        &self,
        raw: BoxedStream,
        mode: EncryptMode,
        compress: bool,
    ) -> Result<BoxedStream, NegotiateError> {
        let secured: BoxedStream = match mode {
            EncryptMode::None => raw,
            EncryptMode::Tls => {
                let acceptor = self.tls.as_ref().ok_or(NegotiateError::Unsupported(mode))?;
                let st = acceptor.accept(raw).await.map_err(NegotiateError::Tls)?;
                Box::new(st)
            }
            EncryptMode::Aes => {
                let secret = self
                    .secret
                    .as_ref()
                    .ok_or(NegotiateError::Unsupported(mode))?;
                let st = aes::establish(raw, secret, aes::Role::Server)
                    .await
                    .map_err(NegotiateError::Aes)?;
                Box::new(st)
            }
        };

        if compress {
            return Ok(Box::new(deflate::compressed(secured)));
        }
        Ok(secured)
    }
}

pub fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("tls: protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls: certificate/key mismatch")?;
    Ok(Arc::new(cfg))
}

pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_file)?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", cert_file.display());
    }
    let key = load_key(key_file)?;
    server_tls_config(certs, key)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse certs {}", path.display()))?;
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("tls: parse key {}", path.display()))?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::tunnel::testkit;

    #[test]
    fn mode_parsing_is_case_insensitive() {
        assert_eq!("TLS".parse::<EncryptMode>().unwrap(), EncryptMode::Tls);
        assert_eq!(" none ".parse::<EncryptMode>().unwrap(), EncryptMode::None);
        assert!(matches!(
            "rot13".parse::<EncryptMode>(),
            Err(NegotiateError::InvalidMode(_))
        ));
    }

    #[test]
    fn capability_follows_configuration() {
        let bare = Negotiator::new(None, Some("  "));
        assert!(bare.check(EncryptMode::None).is_ok());
        assert!(matches!(
            bare.check(EncryptMode::Tls),
            Err(NegotiateError::Unsupported(EncryptMode::Tls))
        ));
        assert!(bare.check(EncryptMode::Aes).is_err());

        let full = Negotiator::new(Some(testkit::tls_server_config()), Some("k"));
        assert!(full.check(EncryptMode::Tls).is_ok());
        assert!(full.check(EncryptMode::Aes).is_ok());
    }

    #[test]
    fn pem_files_load_into_server_config() {
        let dir = testkit::temp_dir("pem_files_load");
        let (cert, key) = testkit::write_self_signed_pem(&dir);
        assert!(load_tls_config(&cert, &key).is_ok());
        assert!(load_tls_config(&key, &key).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn every_mode_round_trips_with_compression() {
        let n = Negotiator::new(Some(testkit::tls_server_config()), Some("shared"));
        for mode in [EncryptMode::None, EncryptMode::Tls, EncryptMode::Aes] {
            for compress in [false, true] {
                let (a, b) = tokio::io::duplex(16 * 1024);
                let server = {
                    let n = n.clone();
                    tokio::spawn(async move { n.accept(Box::new(a), mode, compress).await })
                };
                let mut client = testkit::secure_client(Box::new(b), mode, compress, "shared")
                    .await
                    .unwrap();
                let mut server = server.await.unwrap().unwrap();

                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                client.write_all(b"abc").await.unwrap();
                client.flush().await.unwrap();
                let mut buf = [0u8; 3];
                server.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"abc", "mode={mode} compress={compress}");
            }
        }
    }
}
