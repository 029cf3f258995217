//! Length-prefixed frame transforms layered over a raw byte stream.
//!
//! Every `poll_write` seals the caller's bytes into one frame
//! (`u32` big-endian length + codec output); reads reassemble frames and hand
//! back the opened plaintext. The AES and compression layers are both codecs
//! plugged into [`SealedStream`].

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BufMut, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub mod aes;
pub mod deflate;

/// Largest frame accepted from the peer.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Largest plaintext chunk sealed into a single frame.
pub const MAX_PLAIN_CHUNK: usize = 16 * 1024;

/// Pending outbound bytes above which writes wait for the inner stream.
const WRITE_HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub trait FrameCodec: Send {
    fn seal(&mut self, plain: &[u8]) -> io::Result<Vec<u8>>;
    fn open(&mut self, frame: &[u8]) -> io::Result<Vec<u8>>;
}

pin_project! {
    pub struct SealedStream<S, C> {
        #[pin]
        inner: S,
        codec: C,
        rd_raw: BytesMut,
        rd_plain: BytesMut,
        wr_buf: BytesMut,
        eof: bool,
    }
}

impl<S, C> SealedStream<S, C> {
    pub fn new(inner: S, codec: C) -> Self {
        Self::with_read_buffer(inner, codec, BytesMut::new())
    }

    /// Starts with bytes already read off `inner` (e.g. past a key exchange).
    pub fn with_read_buffer(inner: S, codec: C, rd_raw: BytesMut) -> Self {
        Self {
            inner,
            codec,
            rd_raw,
            rd_plain: BytesMut::new(),
            wr_buf: BytesMut::new(),
            eof: false,
        }
    }
}

fn poll_drain<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    cx: &mut Context<'_>,
    wr_buf: &mut BytesMut,
) -> Poll<io::Result<()>> {
    while !wr_buf.is_empty() {
        let n = ready!(inner.as_mut().poll_write(cx, wr_buf))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        wr_buf.advance(n);
    }
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead, C: FrameCodec> AsyncRead for SealedStream<S, C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.rd_plain.is_empty() {
                let n = buf.remaining().min(this.rd_plain.len());
                buf.put_slice(&this.rd_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.rd_raw.len() >= 4 {
                let len = u32::from_be_bytes([
                    this.rd_raw[0],
                    this.rd_raw[1],
                    this.rd_raw[2],
                    this.rd_raw[3],
                ]) as usize;
                if len > MAX_FRAME_BYTES {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("transform: frame too large ({len})"),
                    )));
                }
                if this.rd_raw.len() >= 4 + len {
                    this.rd_raw.advance(4);
                    let frame = this.rd_raw.split_to(len);
                    let plain = this.codec.open(&frame)?;
                    this.rd_plain.extend_from_slice(&plain);
                    continue;
                }
            }

            if *this.eof {
                if this.rd_raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transform: truncated frame",
                )));
            }

            let mut tmp = [0u8; READ_CHUNK];
            let mut rb = ReadBuf::new(&mut tmp);
            ready!(this.inner.as_mut().poll_read(cx, &mut rb))?;
            if rb.filled().is_empty() {
                *this.eof = true;
            } else {
                this.rd_raw.extend_from_slice(rb.filled());
            }
        }
    }
}

impl<S: AsyncWrite, C: FrameCodec> AsyncWrite for SealedStream<S, C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        if this.wr_buf.len() >= WRITE_HIGH_WATER {
            ready!(poll_drain(this.inner.as_mut(), cx, this.wr_buf))?;
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_PLAIN_CHUNK)];
        let sealed = this.codec.seal(chunk)?;
        this.wr_buf.put_u32(sealed.len() as u32);
        this.wr_buf.extend_from_slice(&sealed);

        // Push what the inner stream takes right now; the rest goes out on the
        // next write or flush.
        if let Poll::Ready(Err(err)) = poll_drain(this.inner.as_mut(), cx, this.wr_buf) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), cx, this.wr_buf))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), cx, this.wr_buf))?;
        this.inner.poll_shutdown(cx)
    }
}
