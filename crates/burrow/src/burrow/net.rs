use std::{borrow::Cow, future::Future, time::Duration};

/// Normalize a bind/listen address.
///
/// Burrow's config and docs commonly use the shorthand `":PORT"` to mean
/// "bind on all interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs
/// do not accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Port component of a listen address such as `":80"`, `"0.0.0.0:443"` or
/// `"[::]:8443"`.
pub fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.trim().rsplit_once(':')?;
    port.parse().ok()
}

/// Runs `fut` under `limit`; a zero limit means no deadline.
/// Returns `None` when the deadline fires first.
pub async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        return Some(fut.await);
    }
    tokio::time::timeout(limit, fut).await.ok()
}
