use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::burrow::tunnel::transform::{FrameCodec, MAX_PLAIN_CHUNK, SealedStream};

/// Raw-deflate frames sharing one dictionary per direction; each frame ends on
/// a sync flush so the peer can decode it without waiting for more input.
pub struct DeflateCodec {
    enc: Compress,
    dec: Decompress,
}

impl DeflateCodec {
    pub fn new() -> Self {
        Self {
            enc: Compress::new(Compression::fast(), false),
            dec: Decompress::new(false),
        }
    }
}

impl FrameCodec for DeflateCodec {
    fn seal(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plain.len() / 2 + 64);
        let start = self.enc.total_in();
        loop {
            let consumed = (self.enc.total_in() - start) as usize;
            self.enc
                .compress_vec(&plain[consumed..], &mut out, FlushCompress::Sync)
                .map_err(io::Error::other)?;
            let consumed = (self.enc.total_in() - start) as usize;
            if consumed == plain.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }

    /// Frames never carry more than [`MAX_PLAIN_CHUNK`] bytes of plaintext;
    /// anything that inflates past that is rejected.
    fn open(&mut self, frame: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(MAX_PLAIN_CHUNK + 1);
        let start = self.dec.total_in();
        loop {
            let consumed = (self.dec.total_in() - start) as usize;
            let produced = out.len();
            self.dec
                .decompress_vec(&frame[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if out.len() > MAX_PLAIN_CHUNK {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate: frame inflates past the plaintext limit",
                ));
            }
            let now_consumed = (self.dec.total_in() - start) as usize;
            if now_consumed == frame.len() {
                return Ok(out);
            }
            if now_consumed == consumed && out.len() == produced {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate: stalled on frame",
                ));
            }
        }
    }
}

pub fn compressed<S>(io: S) -> SealedStream<S, DeflateCodec> {
    SealedStream::new(io, DeflateCodec::new())
}
