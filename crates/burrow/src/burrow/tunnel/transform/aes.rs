//! AES-256-GCM sealed frames keyed from a pre-shared secret.
//!
//! On setup each side sends a random salt in the clear. The key a side seals
//! with is HKDF-SHA256(secret, own salt); the peer opens with the same
//! derivation over the salt it received. Nonces carry the sender's role and a
//! per-direction frame counter, so a reflected frame never opens.

use std::io;

use ring::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    hkdf,
    rand::{SecureRandom, SystemRandom},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::burrow::tunnel::transform::{FrameCodec, SealedStream};

pub const SALT_LEN: usize = 16;

const KEY_INFO: &[u8] = b"burrow aes-256-gcm v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Server => b'S',
            Role::Client => b'C',
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

pub struct AesGcmCodec {
    role: Role,
    seal_key: LessSafeKey,
    open_key: LessSafeKey,
    seal_seq: u64,
    open_seq: u64,
}

impl AesGcmCodec {
    pub fn new(
        secret: &[u8],
        role: Role,
        local_salt: &[u8],
        remote_salt: &[u8],
    ) -> io::Result<Self> {
        Ok(Self {
            role,
            seal_key: derive_key(secret, local_salt)?,
            open_key: derive_key(secret, remote_salt)?,
            seal_seq: 0,
            open_seq: 0,
        })
    }
}

fn derive_key(secret: &[u8], salt: &[u8]) -> io::Result<LessSafeKey> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(secret);
    let info = [KEY_INFO];
    let okm = prk
        .expand(&info, &AES_256_GCM)
        .map_err(|_| io::Error::other("aes: key derivation failed"))?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

fn nonce_for(role: Role, seq: &mut u64) -> io::Result<Nonce> {
    if *seq == u64::MAX {
        return Err(io::Error::other("aes: nonce space exhausted"));
    }
    let mut n = [0u8; NONCE_LEN];
    n[0] = role.tag();
    n[4..].copy_from_slice(&seq.to_be_bytes());
    *seq += 1;
    Ok(Nonce::assume_unique_for_key(n))
}

impl FrameCodec for AesGcmCodec {
    fn seal(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = nonce_for(self.role, &mut self.seal_seq)?;
        let mut buf = Vec::with_capacity(plain.len() + AES_256_GCM.tag_len());
        buf.extend_from_slice(plain);
        self.seal_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| io::Error::other("aes: seal failed"))?;
        Ok(buf)
    }

    fn open(&mut self, frame: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = nonce_for(self.role.peer(), &mut self.open_seq)?;
        let mut buf = frame.to_vec();
        let n = self
            .open_key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "aes: frame authentication failed"))?
            .len();
        buf.truncate(n);
        Ok(buf)
    }
}

/// Runs the salt exchange over `io` and returns the sealed stream.
pub async fn establish<S>(
    mut io: S,
    secret: &[u8],
    role: Role,
) -> io::Result<SealedStream<S, AesGcmCodec>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut local = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut local)
        .map_err(|_| io::Error::other("aes: rng failed"))?;
    io.write_all(&local).await?;
    io.flush().await?;

    let mut remote = [0u8; SALT_LEN];
    io.read_exact(&mut remote).await?;

    let codec = AesGcmCodec::new(secret, role, &local, &remote)?;
    Ok(SealedStream::new(io, codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_with_same_secret_exchange_data() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move { establish(a, b"s3cret", Role::Server).await });
        let mut client = establish(b, b"s3cret", Role::Client).await.unwrap();
        let mut server = server.await.unwrap().unwrap();

        client.write_all(b"hello over aes").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over aes");

        server.write_all(b"back").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn mismatched_secret_fails_authentication() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move { establish(a, b"right", Role::Server).await });
        let mut client = establish(b, b"wrong", Role::Client).await.unwrap();
        let mut server = server.await.unwrap().unwrap();

        client.write_all(b"x").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 1];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reflected_frame_does_not_open() {
        let salt_a = [1u8; SALT_LEN];
        let mut server = AesGcmCodec::new(b"k", Role::Server, &salt_a, &salt_a).unwrap();
        let sealed = server.seal(b"mine").unwrap();
        assert!(server.open(&sealed).is_err());
    }
}
