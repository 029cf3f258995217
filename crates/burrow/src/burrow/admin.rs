use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::burrow::{telemetry, tunnel::registry::Registry};

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub conns: telemetry::SharedConns,
    pub prometheus: Option<telemetry::SharedPrometheusHandle>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/tunnel", any(tunnel_state))
        .route("/tunnels", get(tunnels))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct TunnelStateRequest {
    #[serde(rename = "RemoteAddr", default)]
    remote_addr: String,
}

#[derive(Debug, Serialize)]
struct TunnelStateResponse {
    #[serde(rename = "Tunnels")]
    tunnels: Vec<String>,
}

/// `{"RemoteAddr": ""}` lists every public address; a specific address
/// returns itself when registered and nothing otherwise.
async fn tunnel_state(State(st): State<Arc<AdminState>>, body: Bytes) -> Response {
    let req: TunnelStateRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(err) => {
            tracing::debug!(err = %err, "admin: bad tunnel query body");
            return (StatusCode::BAD_REQUEST, "unmarshal request body failed").into_response();
        }
    };

    let wanted = req.remote_addr.trim();
    let tunnels = if wanted.is_empty() {
        st.registry.public_addrs().await
    } else {
        st.registry
            .lookup(wanted)
            .await
            .map(|t| vec![t.public_addr])
            .unwrap_or_default()
    };

    match serde_json::to_vec(&TunnelStateResponse { tunnels }) {
        Ok(b) => ([(header::CONTENT_TYPE, "application/json")], b).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "marshal response body failed",
        )
            .into_response(),
    }
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot().await))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> Response {
    match &st.prometheus {
        Some(h) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            h.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.conns.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::tunnel::{registry::TunnelRequest, testkit};

    async fn spawn_admin(registry: Arc<Registry>) -> String {
        let state = AdminState {
            registry,
            conns: Arc::default(),
            prometheus: None,
        };
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(ln, router(state)).await;
        });
        format!("http://{addr}")
    }

    async fn registry_with(addrs: &[&str]) -> (Arc<Registry>, tokio::io::DuplexStream) {
        let reg = Arc::new(Registry::default());
        let (session, peer) = testkit::detached_session();
        reg.insert_session(session.clone()).await.unwrap();
        let batch = addrs
            .iter()
            .enumerate()
            .map(|(i, a)| TunnelRequest {
                name: format!("t{i}"),
                public_addr: a.to_string(),
                spec: Default::default(),
            })
            .collect();
        reg.register_tunnels(&session.id(), batch).await.unwrap();
        (reg, peer)
    }

    async fn query(base: &str, body: &str) -> (u16, String) {
        let resp = reqwest::Client::new()
            .post(format!("{base}/tunnel"))
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn empty_remote_addr_lists_everything() {
        let (reg, _peer) = registry_with(&["http://b.test:80", "http://a.test:80"]).await;
        let base = spawn_admin(reg).await;

        let (status, body) = query(&base, r#"{"RemoteAddr":""}"#).await;
        assert_eq!(status, 200);
        assert_eq!(body, r#"{"Tunnels":["http://a.test:80","http://b.test:80"]}"#);

        let (_, body) = query(&base, "{}").await;
        assert_eq!(body, r#"{"Tunnels":["http://a.test:80","http://b.test:80"]}"#);
    }

    #[tokio::test]
    async fn specific_remote_addr_returns_at_most_one() {
        let (reg, _peer) = registry_with(&["http://a.test:80", "https://s.test:443"]).await;
        let base = spawn_admin(reg).await;

        let (_, body) = query(&base, r#"{"RemoteAddr":"https://s.test:443"}"#).await;
        assert_eq!(body, r#"{"Tunnels":["https://s.test:443"]}"#);

        let (_, body) = query(&base, r#"{"RemoteAddr":"http://missing.test:80"}"#).await;
        assert_eq!(body, r#"{"Tunnels":[]}"#);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let base = spawn_admin(Arc::new(Registry::default())).await;
        let (status, _) = query(&base, "not json").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn health_and_conns_respond() {
        let base = spawn_admin(Arc::new(Registry::default())).await;
        let health = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), r#"{"ok":true}"#);
        let conns = reqwest::get(format!("{base}/conns")).await.unwrap();
        assert_eq!(conns.text().await.unwrap(), "[]");
        let metrics = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(metrics.status().as_u16(), 404);
    }
}
