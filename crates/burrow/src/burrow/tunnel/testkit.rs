//! Test-only tunnel client and fixtures.

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

use crate::burrow::tunnel::{
    ClientId,
    control::{PublicEndpoints, Session, SessionParams},
    mux::{self, MuxSession},
    pool::PoolLimits,
    protocol::{
        self, AddTunnels, ClientHello, ControlClientHello, ControlMessage, HandshakeMessage,
        PipeClientHello, TunnelSpec,
    },
    registry::Registry,
    secure::{EncryptMode, Negotiator},
    server::{ServerState, handle_conn},
    transform::{aes, deflate},
    transport::{BoxedStream, RawConnection},
};

pub const SECRET: &str = "shared";
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>, String, String) {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
    let der = cert.der().clone();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    (der, key, cert.pem(), signing_key.serialize_pem())
}

pub fn tls_server_config() -> Arc<rustls::ServerConfig> {
    let (cert, key, _, _) = self_signed();
    crate::burrow::tunnel::secure::server_tls_config(vec![cert], key).unwrap()
}

pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("burrow-{name}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_self_signed_pem(dir: &Path) -> (PathBuf, PathBuf) {
    let (_, _, cert_pem, key_pem) = self_signed();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    std::fs::write(&cert, cert_pem).unwrap();
    std::fs::write(&key, key_pem).unwrap();
    (cert, key)
}

/// Accepts any server certificate. Test clients only.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub fn tls_connector() -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(cfg))
}

/// Client half of the encryption negotiation.
pub async fn secure_client(
    io: BoxedStream,
    mode: EncryptMode,
    compress: bool,
    secret: &str,
) -> io::Result<BoxedStream> {
    let secured: BoxedStream = match mode {
        EncryptMode::None => io,
        EncryptMode::Tls => {
            let name = ServerName::try_from("localhost").unwrap();
            Box::new(tls_connector().connect(name, io).await?)
        }
        EncryptMode::Aes => Box::new(aes::establish(io, secret.as_bytes(), aes::Role::Client).await?),
    };
    if compress {
        return Ok(Box::new(deflate::compressed(secured)));
    }
    Ok(secured)
}

pub fn default_limits() -> PoolLimits {
    PoolLimits {
        max_idle_pipes: 4,
        max_streams: 6,
    }
}

pub fn server_state() -> ServerState {
    ServerState {
        registry: Arc::new(Registry::default()),
        negotiator: Negotiator::new(Some(tls_server_config()), Some(SECRET)),
        limits: default_limits(),
        endpoints: PublicEndpoints {
            server_domain: "tunnel.test".into(),
            http_port: Some(HTTP_PORT),
            https_port: Some(HTTPS_PORT),
        },
        authenticator: None,
        notifier: None,
        handshake_timeout: Duration::from_secs(5),
        control_idle_timeout: Duration::ZERO,
    }
}

/// A session whose control mux talks to nothing but the returned peer.
pub fn detached_session() -> (Arc<Session>, tokio::io::DuplexStream) {
    detached_session_with(default_limits())
}

pub fn detached_session_with(limits: PoolLimits) -> (Arc<Session>, tokio::io::DuplexStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mux = Arc::new(MuxSession::server(Box::new(a), None, mux::CONTROL_STREAMS));
    let params = SessionParams {
        mode: EncryptMode::None,
        compress: false,
        version: "test".into(),
    };
    (Arc::new(Session::new(ClientId::new(), params, mux, limits)), b)
}

/// Pools an in-memory pipe on `session`; returns the client end.
pub fn attach_local_pipe(session: &Session) -> MuxSession {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let max_streams = session.pool().limits().max_streams;
    let server = Arc::new(MuxSession::server(Box::new(a), None, max_streams));
    session.pool().add(server).unwrap();
    MuxSession::client(Box::new(b), None)
}

pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

pub async fn wait_for_lookup_miss(registry: &Registry, addr: &str) {
    for _ in 0..500 {
        if registry.lookup(addr).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{addr} still registered after 5s");
}

/// True when the peer closes without sending anything further.
pub async fn closed_without_reply(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        _ => false,
    }
}

pub async fn send_client_hello(raw: &mut TcpStream, mode: &str, compress: bool) -> HandshakeMessage {
    let hello = HandshakeMessage::ClientHello(ClientHello {
        encrypt_mode: mode.into(),
        enable_compress: compress,
        version: "test".into(),
    });
    protocol::write_message(raw, &hello).await.unwrap();
    protocol::read_message(raw).await.unwrap()
}

pub async fn send_pipe_hello(raw: &mut TcpStream, hello: &PipeClientHello) {
    let msg = HandshakeMessage::PipeClientHello(hello.clone());
    protocol::write_message(raw, &msg).await.unwrap();
}

/// Control/pipe listener on loopback driving [`handle_conn`].
pub struct TestServer {
    pub state: Arc<ServerState>,
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    pub async fn start(state: ServerState) -> Self {
        let state = Arc::new(state);
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((conn, remote)) = ln.accept().await {
                    let raw = RawConnection {
                        stream: Box::new(conn),
                        remote: Some(remote),
                    };
                    tokio::spawn(handle_conn(state.clone(), raw));
                }
            })
        };
        Self { state, addr, task }
    }

    pub async fn dial(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    pub async fn connect(&self, mode: EncryptMode, compress: bool) -> TestClient {
        self.connect_with_token(mode, compress, "").await.unwrap()
    }

    /// Runs the full client handshake; returns the server's control reply on
    /// rejection.
    pub async fn connect_with_token(
        &self,
        mode: EncryptMode,
        compress: bool,
        token: &str,
    ) -> Result<TestClient, ControlMessage> {
        let mut raw = self.dial().await;
        let reply = send_client_hello(&mut raw, mode.as_str(), compress).await;
        assert_eq!(reply, HandshakeMessage::ServerHello);

        let secured = secure_client(Box::new(raw), mode, compress, SECRET).await.unwrap();
        let mux = MuxSession::client(secured, None);
        let mut control = mux.open_stream().await.unwrap();

        let hello = ControlMessage::ControlClientHello(ControlClientHello {
            auth_token: token.into(),
        });
        protocol::write_message(&mut control, &hello).await.unwrap();
        let id = match protocol::read_message(&mut control).await.unwrap() {
            ControlMessage::ControlServerHello(h) => h.client_id,
            other => return Err(other),
        };

        let batch = ControlMessage::AddTunnels(AddTunnels::default());
        protocol::write_message(&mut control, &batch).await.unwrap();
        match protocol::read_message(&mut control).await.unwrap() {
            ControlMessage::TunnelsAdded(_) => {}
            other => return Err(other),
        }

        Ok(TestClient {
            id,
            mode,
            compress,
            mux,
            control: Mutex::new(control),
        })
    }
}

pub struct TestClient {
    pub id: ClientId,
    mode: EncryptMode,
    compress: bool,
    mux: MuxSession,
    control: Mutex<BoxedStream>,
}

impl TestClient {
    pub async fn request(&self, msg: &ControlMessage) -> ControlMessage {
        let mut control = self.control.lock().await;
        protocol::write_message(&mut *control, msg).await.unwrap();
        protocol::read_message(&mut *control).await.unwrap()
    }

    pub async fn ping(&self) -> ControlMessage {
        self.request(&ControlMessage::Ping).await
    }

    pub async fn try_add_tunnel(&self, name: &str, proto: &str, host: &str) -> ControlMessage {
        let mut tunnels = BTreeMap::new();
        tunnels.insert(
            name.to_string(),
            TunnelSpec {
                protocol: proto.into(),
                hostname: host.into(),
                ..TunnelSpec::default()
            },
        );
        self.request(&ControlMessage::AddTunnels(AddTunnels { tunnels })).await
    }

    pub async fn add_tunnel(&self, name: &str, proto: &str, host: &str) -> BTreeMap<String, String> {
        match self.try_add_tunnel(name, proto, host).await {
            ControlMessage::TunnelsAdded(added) => added.tunnels,
            other => panic!("add tunnel {name}: {other:?}"),
        }
    }

    pub async fn add_tunnel_spec(&self, name: &str, spec: TunnelSpec) -> BTreeMap<String, String> {
        let mut tunnels = BTreeMap::new();
        tunnels.insert(name.to_string(), spec);
        match self.request(&ControlMessage::AddTunnels(AddTunnels { tunnels })).await {
            ControlMessage::TunnelsAdded(added) => added.tunnels,
            other => panic!("add tunnel {name}: {other:?}"),
        }
    }

    /// Dials a pipe for this session; returns the client side of its mux.
    pub async fn open_pipe(&self, srv: &TestServer) -> MuxSession {
        let mut raw = srv.dial().await;
        send_pipe_hello(&mut raw, &PipeClientHello { client_id: self.id }).await;
        let secured = secure_client(Box::new(raw), self.mode, self.compress, SECRET)
            .await
            .unwrap();
        MuxSession::client(secured, None)
    }

    pub fn mux(&self) -> &MuxSession {
        &self.mux
    }
}

/// Serves work streams on a client pipe like a local HTTP service: replies
/// with the tunnel name and the Host header it received.
pub fn serve_http_backend(pipe: MuxSession) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(mut st) = pipe.accept_stream().await {
            tokio::spawn(async move {
                let Ok(tunnel) = protocol::read_work_stream_header(&mut st).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match st.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&head);
                let host = text
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("host").then(|| v.trim().to_string())
                    })
                    .unwrap_or_default();
                let body = format!("{tunnel} {host}");
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = st.write_all(resp.as_bytes()).await;
                let _ = st.shutdown().await;
            });
        }
    })
}
