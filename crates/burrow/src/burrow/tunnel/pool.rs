//! Bounded pool of pipes owned by one control session.
//!
//! Pipes live in a generational arena: a [`PipeId`] names a slot plus the
//! generation it was issued for, so releases or removals racing with eviction
//! or teardown cannot touch a slot that has since been reused.

use std::{
    fmt,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::burrow::tunnel::{mux::MuxSession, transport::BoxedStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle_pipes: usize,
    pub max_streams: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted: no pipe with spare stream capacity")]
    Exhausted,
    #[error("idle pipes at capacity ({0})")]
    IdleFull(usize),
    #[error("pool closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub streams: usize,
}

struct PipeEntry {
    session: Arc<MuxSession>,
    streams: usize,
}

struct Slot {
    generation: u32,
    pipe: Option<PipeEntry>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    idle: usize,
    closed: bool,
}

impl PoolState {
    fn entry_mut(&mut self, id: PipeId) -> Option<&mut PipeEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.pipe.as_mut()
    }

    fn take(&mut self, id: PipeId) -> Option<PipeEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.pipe.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if entry.streams == 0 {
            self.idle -= 1;
        }
        metrics::gauge!("burrow_pipes").decrement(1.0);
        Some(entry)
    }
}

pub struct PipePool {
    limits: PoolLimits,
    state: Mutex<PoolState>,
}

impl fmt::Debug for PipePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipePool")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PipePool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Nothing panics while holding the lock; recover the state regardless.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Pools a freshly handshaked pipe as idle, unless the idle set is full.
    pub fn add(&self, session: Arc<MuxSession>) -> Result<PipeId, PoolError> {
        let mut st = self.lock();
        if st.closed {
            return Err(PoolError::Closed);
        }
        if st.idle >= self.limits.max_idle_pipes {
            return Err(PoolError::IdleFull(self.limits.max_idle_pipes));
        }

        let entry = PipeEntry {
            session,
            streams: 0,
        };
        let id = match st.free.pop() {
            Some(index) => {
                let slot = &mut st.slots[index as usize];
                slot.pipe = Some(entry);
                PipeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = st.slots.len() as u32;
                st.slots.push(Slot {
                    generation: 0,
                    pipe: Some(entry),
                });
                PipeId {
                    index,
                    generation: 0,
                }
            }
        };
        st.idle += 1;
        metrics::gauge!("burrow_pipes").increment(1.0);
        Ok(id)
    }

    /// Reserves one stream slot on a pipe with spare capacity.
    ///
    /// Pipes already carrying streams are preferred so idle pipes stay idle.
    /// Never waits: with no capacity left the caller gets
    /// [`PoolError::Exhausted`] and the client is expected to dial more pipes.
    pub fn acquire(&self) -> Result<(PipeId, Arc<MuxSession>), PoolError> {
        let mut st = self.lock();
        if st.closed {
            return Err(PoolError::Closed);
        }

        let mut dead = Vec::new();
        let mut busy_pick = None;
        let mut idle_pick = None;
        for (index, slot) in st.slots.iter().enumerate() {
            let Some(p) = &slot.pipe else { continue };
            let id = PipeId {
                index: index as u32,
                generation: slot.generation,
            };
            if p.session.is_closed() {
                dead.push(id);
                continue;
            }
            if p.streams >= self.limits.max_streams {
                continue;
            }
            if p.streams > 0 {
                if busy_pick.is_none() {
                    busy_pick = Some(id);
                }
            } else if idle_pick.is_none() {
                idle_pick = Some(id);
            }
        }
        for id in dead {
            st.take(id);
        }

        let id = busy_pick.or(idle_pick).ok_or(PoolError::Exhausted)?;
        let was_idle = {
            let Some(entry) = st.entry_mut(id) else {
                return Err(PoolError::Exhausted);
            };
            entry.streams += 1;
            entry.streams == 1
        };
        if was_idle {
            st.idle -= 1;
        }
        let session = st
            .entry_mut(id)
            .map(|e| e.session.clone())
            .ok_or(PoolError::Exhausted)?;
        Ok((id, session))
    }

    /// Returns a stream slot. A pipe dropping back to zero streams rejoins the
    /// idle set, or is evicted (and handed back for closing) when that set is
    /// already full.
    pub fn release(&self, id: PipeId) -> Option<Arc<MuxSession>> {
        let mut st = self.lock();
        let now_idle = {
            let entry = st.entry_mut(id)?;
            entry.streams = entry.streams.saturating_sub(1);
            entry.streams == 0
        };
        if !now_idle {
            return None;
        }
        if st.idle < self.limits.max_idle_pipes {
            st.idle += 1;
            return None;
        }

        // Count it idle so `take` keeps the books balanced.
        st.idle += 1;
        st.take(id).map(|e| e.session)
    }

    /// Drops a pipe whose connection went away. Stale ids are ignored.
    pub fn remove(&self, id: PipeId) -> Option<Arc<MuxSession>> {
        self.lock().take(id).map(|e| e.session)
    }

    /// Empties the pool for good and returns every pipe for closing.
    pub fn close(&self) -> Vec<Arc<MuxSession>> {
        let mut st = self.lock();
        st.closed = true;
        let ids: Vec<PipeId> = st
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pipe.is_some())
            .map(|(i, s)| PipeId {
                index: i as u32,
                generation: s.generation,
            })
            .collect();
        ids.into_iter()
            .filter_map(|id| st.take(id).map(|e| e.session))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.lock();
        let mut out = PoolStats::default();
        for p in st.slots.iter().filter_map(|s| s.pipe.as_ref()) {
            if p.streams == 0 {
                out.idle += 1;
            } else {
                out.busy += 1;
                out.streams += p.streams;
            }
        }
        out
    }
}

/// Holds one reserved stream slot; returns it to the pool when dropped.
pub struct Lease {
    pool: Arc<PipePool>,
    id: PipeId,
}

impl Lease {
    pub fn new(pool: Arc<PipePool>, id: PipeId) -> Self {
        Self { pool, id }
    }

    pub fn pipe_id(&self) -> PipeId {
        self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(evicted) = self.pool.release(self.id) else {
            return;
        };
        tracing::debug!(pipe = %self.id, "pool: evicting surplus idle pipe");
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { evicted.close().await });
        }
    }
}

pin_project! {
    /// A multiplexed stream on a pipe, carrying one proxied connection.
    pub struct WorkStream {
        #[pin]
        stream: BoxedStream,
        lease: Lease,
    }
}

impl WorkStream {
    pub fn new(stream: BoxedStream, lease: Lease) -> Self {
        Self { stream, lease }
    }

    pub fn pipe_id(&self) -> PipeId {
        self.lease.pipe_id()
    }
}

impl AsyncRead for WorkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for WorkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
