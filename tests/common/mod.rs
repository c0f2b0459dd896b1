#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use russh::keys::ssh_key::{self, HashAlg};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use sshtunnel_harness::{
    config::Timeouts,
    tunnel::{Endpoint, RetryPolicy},
};

pub const HOST_KEY: &str = include_str!("../fixtures/host_ed25519");
pub const CLIENT_KEY: &str = include_str!("../fixtures/client_ed25519");
pub const CLIENT_PUB: &str = include_str!("../fixtures/client_ed25519.pub");
pub const ENCRYPTED_KEY: &str = include_str!("../fixtures/client_ed25519_encrypted");
pub const ENCRYPTED_PUB: &str = include_str!("../fixtures/client_ed25519_encrypted.pub");
pub const STRANGER_KEY: &str = include_str!("../fixtures/stranger_ed25519");
pub const RSA_PEM_KEY: &str = include_str!("../fixtures/client_rsa.pem");
pub const RSA_PEM_PUB: &str = include_str!("../fixtures/client_rsa.pem.pub");
pub const RSA_PEM_ENCRYPTED_KEY: &str = include_str!("../fixtures/client_rsa_encrypted.pem");
pub const RSA_OPENSSH_KEY: &str = include_str!("../fixtures/client_rsa");
pub const RSA_OPENSSH_PUB: &str = include_str!("../fixtures/client_rsa.pub");
pub const PASSPHRASE: &str = "correct horse";

pub const USER: &str = "tunnel";
pub const PASSWORD: &str = "bastion-pass";

/// Small timeouts and near-instant backoff so failure paths finish quickly.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        connect_ms: 5_000,
        operation_ms: 5_000,
        teardown_ms: 2_000,
    }
}

/// An in-process SSH server that accepts [`USER`] with [`PASSWORD`] or
/// any fixture client key, and serves `direct-tcpip` by dialing out.
pub struct TestBastion {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub forwards: Arc<AtomicUsize>,
    fingerprint: String,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestBastion {
    pub async fn start() -> anyhow::Result<Self> {
        let host_key = russh::keys::PrivateKey::from_openssh(HOST_KEY)?;
        let fingerprint = host_key.public_key().fingerprint(HashAlg::Sha256).to_string();

        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        });

        let authorized = vec![
            ssh_key::PublicKey::from_openssh(CLIENT_PUB.trim())?,
            ssh_key::PublicKey::from_openssh(ENCRYPTED_PUB.trim())?,
            ssh_key::PublicKey::from_openssh(RSA_PEM_PUB.trim())?,
            ssh_key::PublicKey::from_openssh(RSA_OPENSSH_PUB.trim())?,
        ];
        let connections = Arc::new(AtomicUsize::new(0));
        let forwards = Arc::new(AtomicUsize::new(0));
        let mut server = Bastion {
            authorized: Arc::new(authorized),
            connections: connections.clone(),
            forwards: forwards.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run_on_socket(config, &listener).await {
                debug!("test bastion stopped: {}", e);
            }
        });

        Ok(Self {
            addr,
            connections,
            forwards,
            fingerprint,
            _handle: handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct Bastion {
    authorized: Arc<Vec<ssh_key::PublicKey>>,
    connections: Arc<AtomicUsize>,
    forwards: Arc<AtomicUsize>,
}

impl server::Server for Bastion {
    type Handler = Self;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!("test bastion: client from {:?}", peer_addr);
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }
}

impl server::Handler for Bastion {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let known = self
            .authorized
            .iter()
            .any(|k| k.key_data() == public_key.key_data());
        if user == USER && known {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        match TcpStream::connect((host_to_connect, port)).await {
            Ok(mut remote) => {
                self.forwards.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                });
                Ok(true)
            }
            Err(e) => {
                debug!("test bastion: cannot reach {}:{}: {}", host_to_connect, port, e);
                Ok(false)
            }
        }
    }
}

pub struct EchoServer {
    pub addr: SocketAddr,
    _handle: tokio::task::JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 1024];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) => break,
                            Ok(n) => {
                                if stream.write_all(&buffer[..n]).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            _handle: handle,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }
}

/// Accepts TCP connections and never says a word, so SSH handshakes hang.
pub struct SilentServer {
    pub addr: SocketAddr,
    pub accepts: Arc<AtomicUsize>,
    _handle: tokio::task::JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();

        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        Ok(Self {
            addr,
            accepts,
            _handle: handle,
        })
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// A port nothing is listening on.
pub async fn closed_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// True once nothing accepts on `endpoint` any more.
pub async fn is_closed(endpoint: &Endpoint) -> bool {
    TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .is_err()
}
