//! Non-destructive host extraction from HTTP requests and TLS ClientHellos.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use pin_project_lite::pin_project;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("need more data")]
    NeedMoreData,
    #[error("no match")]
    NoMatch,
}

pub trait HostParser: Send + Sync {
    fn name(&self) -> &str;
    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError>;
}

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("sniff: timed out")]
    Timeout,
    #[error("sniff: connection closed before a host was seen")]
    Closed,
    #[error("sniff: prelude exceeds {0} bytes")]
    TooLarge(usize),
    #[error("sniff: {0} prelude carries no host")]
    NoHost(String),
    #[error("sniff: read: {0}")]
    Io(#[from] io::Error),
}

/// The host a connection asked for and every byte read to learn it.
#[derive(Debug)]
pub struct Sniffed {
    pub host: String,
    pub prelude: Vec<u8>,
}

/// Reads from `conn` until `parser` yields a host, at most `max_bytes`.
pub async fn sniff<S>(
    conn: &mut S,
    parser: &dyn HostParser,
    max_bytes: usize,
) -> Result<Sniffed, SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut captured: Vec<u8> = Vec::with_capacity(4096.min(max_bytes));
    let mut tmp = vec![0u8; 4096];
    loop {
        let room = max_bytes.saturating_sub(captured.len()).min(tmp.len());
        if room == 0 {
            return Err(SniffError::TooLarge(max_bytes));
        }
        let n = conn.read(&mut tmp[..room]).await?;
        if n == 0 {
            return Err(SniffError::Closed);
        }
        captured.extend_from_slice(&tmp[..n]);

        match parser.parse(&captured) {
            Ok(host) => {
                return Ok(Sniffed {
                    host,
                    prelude: captured,
                });
            }
            Err(ParseError::NeedMoreData) => continue,
            Err(ParseError::NoMatch) => return Err(SniffError::NoHost(parser.name().into())),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_request_line(line: &str) -> bool {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !method.is_empty()
        && method.bytes().all(|b| b.is_ascii_uppercase())
        && !target.is_empty()
        && version.starts_with("HTTP/1.")
}

/// Lowercased host without port or trailing dot.
fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        &raw[..raw.find(']')? + 1]
    } else {
        match raw.rsplit_once(':') {
            Some((h, port)) if port.bytes().all(|b| b.is_ascii_digit()) => h,
            _ => raw,
        }
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Host header of an HTTP/1.x request. Waits for the complete header block.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpHostParser;

impl HostParser for HttpHostParser {
    fn name(&self) -> &str {
        "http"
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        let Some(end) = find(prelude, b"\r\n\r\n") else {
            if let Some(eol) = find(prelude, b"\r\n") {
                let line = std::str::from_utf8(&prelude[..eol]).map_err(|_| ParseError::NoMatch)?;
                if !is_request_line(line) {
                    return Err(ParseError::NoMatch);
                }
            }
            return Err(ParseError::NeedMoreData);
        };

        let head = std::str::from_utf8(&prelude[..end]).map_err(|_| ParseError::NoMatch)?;
        let mut lines = head.split("\r\n");
        if !lines.next().is_some_and(is_request_line) {
            return Err(ParseError::NoMatch);
        }
        for line in lines {
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            if k.trim().eq_ignore_ascii_case("host") {
                return normalize_host(v).ok_or(ParseError::NoMatch);
            }
        }
        Err(ParseError::NoMatch)
    }
}

/// Replaces the value of the request's Host header. Returns `None` when the
/// prelude holds no complete header block with a Host line.
pub fn rewrite_http_host(prelude: &[u8], new_host: &str) -> Option<Vec<u8>> {
    let end = find(prelude, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&prelude[..end]).ok()?;

    let mut out = Vec::with_capacity(prelude.len() + new_host.len());
    let mut replaced = false;
    for (i, line) in head.split("\r\n").enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n");
        }
        let is_host = i > 0
            && !replaced
            && line
                .split_once(':')
                .is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case("host"));
        if is_host {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(new_host.as_bytes());
            replaced = true;
        } else {
            out.extend_from_slice(line.as_bytes());
        }
    }
    if !replaced {
        return None;
    }
    out.extend_from_slice(&prelude[end..]);
    Some(out)
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<usize> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// server_name extension of a TLS ClientHello carried in the first record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsSniParser;

impl TlsSniParser {
    fn server_name(hello: &[u8]) -> Option<String> {
        let mut c = Cursor { buf: hello };
        c.take(2 + 32)?; // legacy_version, random
        let sid = c.u8()? as usize;
        c.take(sid)?;
        let suites = c.u16()?;
        c.take(suites)?;
        let comp = c.u8()? as usize;
        c.take(comp)?;

        let ext_len = c.u16()?;
        let mut exts = Cursor {
            buf: c.take(ext_len)?,
        };
        while !exts.buf.is_empty() {
            let ty = exts.u16()?;
            let len = exts.u16()?;
            let body = exts.take(len)?;
            if ty != usize::from(EXT_SERVER_NAME) {
                continue;
            }
            let mut sni = Cursor { buf: body };
            let list_len = sni.u16()?;
            let mut list = Cursor {
                buf: sni.take(list_len)?,
            };
            while !list.buf.is_empty() {
                let name_type = list.u8()?;
                let name_len = list.u16()?;
                let name = list.take(name_len)?;
                if name_type == NAME_TYPE_HOST {
                    let name = std::str::from_utf8(name).ok()?;
                    return normalize_host(name);
                }
            }
        }
        None
    }
}

impl HostParser for TlsSniParser {
    fn name(&self) -> &str {
        "tls"
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        if prelude.is_empty() {
            return Err(ParseError::NeedMoreData);
        }
        if prelude[0] != TLS_HANDSHAKE {
            return Err(ParseError::NoMatch);
        }
        if prelude.len() < 5 {
            return Err(ParseError::NeedMoreData);
        }
        let record_len = u16::from_be_bytes([prelude[3], prelude[4]]) as usize;
        if prelude.len() < 5 + record_len {
            return Err(ParseError::NeedMoreData);
        }

        let mut record = Cursor {
            buf: &prelude[5..5 + record_len],
        };
        if record.u8() != Some(CLIENT_HELLO) {
            return Err(ParseError::NoMatch);
        }
        // A ClientHello split across records is not followed.
        let hello_len = record.u24().ok_or(ParseError::NoMatch)?;
        let hello = record.take(hello_len).ok_or(ParseError::NoMatch)?;
        Self::server_name(hello).ok_or(ParseError::NoMatch)
    }
}

pin_project! {
    /// Replays already-read bytes before reading from `inner` again.
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    /// Minimal ClientHello record with an optional SNI extension.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut exts = Vec::new();
        // An unrelated extension first (supported_groups, empty list).
        exts.extend_from_slice(&[0x00, 0x0a, 0x00, 0x02, 0x00, 0x00]);
        if let Some(name) = sni {
            let n = name.len() as u16;
            exts.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            exts.extend_from_slice(&(n + 5).to_be_bytes());
            exts.extend_from_slice(&(n + 3).to_be_bytes());
            exts.push(NAME_TYPE_HOST);
            exts.extend_from_slice(&n.to_be_bytes());
            exts.extend_from_slice(name.as_bytes());
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[7u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![CLIENT_HELLO];
        let len = body.len() as u32;
        hs.extend_from_slice(&len.to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut rec = vec![TLS_HANDSHAKE, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    #[test]
    fn http_host_is_normalized() {
        let p = HttpHostParser;
        let req = b"GET / HTTP/1.1\r\nUser-Agent: t\r\nhOsT: A.Example.com:8080\r\n\r\n";
        assert_eq!(p.parse(req).unwrap(), "a.example.com");

        let v6 = b"GET / HTTP/1.1\r\nHost: [::1]:80\r\n\r\n";
        assert_eq!(p.parse(v6).unwrap(), "[::1]");
    }

    #[test]
    fn http_parser_waits_for_header_block_and_rejects_junk() {
        let p = HttpHostParser;
        assert!(matches!(
            p.parse(b"GET / HTTP/1.1\r\nHost: a"),
            Err(ParseError::NeedMoreData)
        ));
        assert!(matches!(p.parse(b"GET / HT"), Err(ParseError::NeedMoreData)));
        assert!(matches!(
            p.parse(b"\x16\x03\x01 garbage\r\n"),
            Err(ParseError::NoMatch)
        ));
        assert!(matches!(
            p.parse(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(ParseError::NoMatch)
        ));
    }

    #[test]
    fn host_rewrite_keeps_everything_else() {
        let req = b"POST /x HTTP/1.1\r\nHost: public.test\r\nX-A: 1\r\n\r\nbody";
        let out = rewrite_http_host(req, "localhost:3000").unwrap();
        assert_eq!(
            out,
            b"POST /x HTTP/1.1\r\nHost: localhost:3000\r\nX-A: 1\r\n\r\nbody".to_vec()
        );
        assert!(rewrite_http_host(b"GET / HTTP/1.1\r\n\r\n", "x").is_none());
    }

    #[test]
    fn sni_is_extracted_from_client_hello() {
        let p = TlsSniParser;
        let rec = client_hello(Some("Secure.Example.com"));
        assert_eq!(p.parse(&rec).unwrap(), "secure.example.com");

        assert!(matches!(p.parse(&rec[..20]), Err(ParseError::NeedMoreData)));
        assert!(matches!(
            p.parse(&client_hello(None)),
            Err(ParseError::NoMatch)
        ));
        assert!(matches!(p.parse(b"GET / HTTP/1.1"), Err(ParseError::NoMatch)));
    }

    #[tokio::test]
    async fn sniff_keeps_all_bytes_for_replay() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
        a.write_all(&req[..10]).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            a.write_all(&req[10..]).await.unwrap();
            a.write_all(b"tail").await.unwrap();
            a
        });

        let got = sniff(&mut b, &HttpHostParser, 4096).await.unwrap();
        assert_eq!(got.host, "a.test");
        let _a = writer.await.unwrap();

        let mut replay = PrefixedStream::new(got.prelude, b);
        let mut buf = vec![0u8; req.len() + 4];
        replay.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(req));
        assert!(buf.ends_with(b"tail"));
    }

    #[tokio::test]
    async fn sniff_enforces_size_cap_and_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"GET / HTTP/1.1\r\nX-Pad: aaaaaaaaaaaaaaaaaaaa\r\n").await.unwrap();
        let err = sniff(&mut b, &HttpHostParser, 24).await.unwrap_err();
        assert!(matches!(err, SniffError::TooLarge(24)));

        drop(a);
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            sniff(&mut b, &TlsSniParser, 1024).await.unwrap_err(),
            SniffError::Closed
        ));
    }
}
