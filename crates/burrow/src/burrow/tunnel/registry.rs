use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use tokio::sync::RwLock;

use crate::burrow::tunnel::{ClientId, control::Session, pool::PoolStats, protocol::TunnelSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("public address {0} already in use")]
    AddressInUse(String),
    #[error("unknown client {0}")]
    UnknownSession(ClientId),
    #[error("client {0} already registered")]
    DuplicateSession(ClientId),
}

/// `scheme://host:port`, the key every tunnel is registered and looked up by.
pub fn public_addr(scheme: &str, host: &str, port: u16) -> String {
    format!("{scheme}://{}:{port}", host.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct Tunnel {
    pub name: String,
    pub public_addr: String,
    pub spec: TunnelSpec,
    pub session: Arc<Session>,
}

/// One tunnel a session asks to publish.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub name: String,
    pub public_addr: String,
    pub spec: TunnelSpec,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub public_addr: String,
    pub client_id: ClientId,
    pub remote: String,
    pub pipes: PoolStats,
}

struct SessionEntry {
    session: Arc<Session>,
    addrs: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    tunnels: HashMap<String, Tunnel>,
    sessions: HashMap<ClientId, SessionEntry>,
}

/// Public address → tunnel, plus the live sessions pipes may attach to.
///
/// Both maps sit behind one lock so a reader sees a session and all of its
/// tunnels together, or none of them.
#[derive(Default)]
pub struct Registry {
    state: RwLock<State>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub async fn insert_session(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut st = self.state.write().await;
        let id = session.id();
        if st.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        st.sessions.insert(
            id,
            SessionEntry {
                session,
                addrs: BTreeSet::new(),
            },
        );
        Ok(())
    }

    pub async fn session(&self, id: &ClientId) -> Option<Arc<Session>> {
        let st = self.state.read().await;
        st.sessions.get(id).map(|e| e.session.clone())
    }

    /// Publishes a batch of tunnels for a session. Either every address is
    /// free and the whole batch is inserted, or nothing changes.
    pub async fn register_tunnels(
        &self,
        id: &ClientId,
        batch: Vec<TunnelRequest>,
    ) -> Result<(), RegistryError> {
        let mut st = self.state.write().await;
        let session = st
            .sessions
            .get(id)
            .map(|e| e.session.clone())
            .ok_or(RegistryError::UnknownSession(*id))?;

        let mut seen = BTreeSet::new();
        for req in &batch {
            if st.tunnels.contains_key(&req.public_addr) || !seen.insert(req.public_addr.as_str()) {
                return Err(RegistryError::AddressInUse(req.public_addr.clone()));
            }
        }

        let mut added = Vec::with_capacity(batch.len());
        for req in batch {
            added.push(req.public_addr.clone());
            st.tunnels.insert(
                req.public_addr.clone(),
                Tunnel {
                    name: req.name,
                    public_addr: req.public_addr,
                    spec: req.spec,
                    session: session.clone(),
                },
            );
        }
        if let Some(entry) = st.sessions.get_mut(id) {
            entry.addrs.extend(added);
        }
        Ok(())
    }

    pub async fn lookup(&self, public_addr: &str) -> Option<Tunnel> {
        let st = self.state.read().await;
        st.tunnels.get(public_addr).cloned()
    }

    /// Removes a session and every tunnel it owns under one write lock.
    /// Returns the session and the addresses that were unpublished.
    pub async fn remove_session(&self, id: &ClientId) -> Option<(Arc<Session>, Vec<String>)> {
        let mut st = self.state.write().await;
        let entry = st.sessions.remove(id)?;
        for addr in &entry.addrs {
            st.tunnels.remove(addr);
        }
        Some((entry.session, entry.addrs.into_iter().collect()))
    }

    pub async fn public_addrs(&self) -> Vec<String> {
        let st = self.state.read().await;
        let mut out: Vec<String> = st.tunnels.keys().cloned().collect();
        out.sort();
        out
    }

    pub async fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let st = self.state.read().await;
        let mut out: Vec<TunnelSnapshot> = st
            .tunnels
            .values()
            .map(|t| TunnelSnapshot {
                name: t.name.clone(),
                public_addr: t.public_addr.clone(),
                client_id: t.session.id(),
                remote: t
                    .session
                    .remote_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                pipes: t.session.pool_stats(),
            })
            .collect();
        out.sort_by(|a, b| a.public_addr.cmp(&b.public_addr));
        out
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}
