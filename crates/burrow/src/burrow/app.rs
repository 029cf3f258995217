use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::burrow::{
    admin, config, logging, net, telemetry,
    tunnel::{
        auth::{Authenticator, HttpAuthenticator, Notifier},
        control::PublicEndpoints,
        registry::Registry,
        secure::{self, Negotiator},
        server::{Server, ServerOptions, ServerState},
    },
    vhost::{Scheme, VhostListener, VhostOptions},
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let tls = match &cfg.tls {
        Some(t) => Some(secure::load_tls_config(&t.cert_file, &t.key_file)?),
        None => None,
    };
    let negotiator = Negotiator::new(tls, cfg.aes_secret.as_deref());

    let authenticator: Option<Arc<dyn Authenticator>> = match &cfg.auth_url {
        Some(url) => Some(Arc::new(HttpAuthenticator::new(url.clone())?)),
        None => None,
    };
    let notifier = match &cfg.notify {
        Some(n) => Some(Notifier::new(n.url.clone(), n.key.clone())?),
        None => None,
    };

    if cfg.tls.is_none() && !cfg.https_addr.is_empty() {
        tracing::info!("vhost: no tls certificate configured; https listener disabled");
    }

    tracing::info!(
        config = %resolved.path.display(),
        control_addr = %cfg.control_addr,
        control_transports = ?cfg.control_transports,
        http_addr = %cfg.http_addr,
        https_enabled = cfg.https_port().is_some(),
        admin_addr = %cfg.admin_addr,
        server_domain = %cfg.server_domain,
        tls = cfg.tls.is_some(),
        aes = cfg.aes_secret.is_some(),
        auth = cfg.auth_url.is_some(),
        max_idle_pipes = cfg.pool.max_idle_pipes,
        max_streams = cfg.pool.max_streams,
        "burrow: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let conns = Arc::new(telemetry::ConnRegistry::new());
    let registry = Arc::new(Registry::default());

    let state = Arc::new(ServerState {
        registry: registry.clone(),
        negotiator: negotiator.clone(),
        limits: cfg.pool,
        endpoints: PublicEndpoints {
            server_domain: cfg.server_domain.clone(),
            http_port: cfg.http_port(),
            https_port: cfg.https_port(),
        },
        authenticator,
        notifier,
        handshake_timeout: cfg.timeouts.handshake_timeout,
        control_idle_timeout: cfg.timeouts.control_idle_timeout,
    });

    let vhost_opts = Arc::new(VhostOptions {
        registry: registry.clone(),
        tls: negotiator.tls_acceptor().cloned(),
        sniff_timeout: cfg.timeouts.sniff_timeout,
        max_header_bytes: cfg.max_header_bytes,
        conns: conns.clone(),
    });

    // Bind public listeners up front so a port conflict is fatal at startup.
    let mut vhosts = Vec::new();
    if let Some(port) = cfg.http_port() {
        vhosts.push(
            VhostListener::bind(&cfg.http_addr, Scheme::Http, Some(port), vhost_opts.clone())
                .await?,
        );
    }
    if let Some(port) = cfg.https_port() {
        vhosts.push(
            VhostListener::bind(&cfg.https_addr, Scheme::Https, Some(port), vhost_opts.clone())
                .await?,
        );
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            registry: registry.clone(),
            conns: conns.clone(),
            prometheus: Some(prom.clone()),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Control listeners, one per transport.
    for transport in &cfg.control_transports {
        let server = Server::new(
            ServerOptions {
                listen_addr: cfg.control_addr.clone(),
                transport: transport.clone(),
            },
            state.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    // Public HTTP/HTTPS listeners.
    for vh in vhosts {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { vh.serve(shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let sessions = registry.session_count().await;
    tracing::info!(sessions, "burrow: stopped");

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: install SIGTERM handler failed");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
