use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use russh::client::{self, AuthResult};
use russh::keys::ssh_key;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::{Credential, ServerKeyVerification, TunnelConfig};
use crate::error::{ConnectError, ConnectErrorKind};

pub(crate) type SshHandle = client::Handle<TunnelClientHandler>;

pub(crate) struct TunnelClientHandler {
    verification: ServerKeyVerification,
    host_key_rejected: Arc<AtomicBool>,
}

impl TunnelClientHandler {
    fn new(verification: ServerKeyVerification, host_key_rejected: Arc<AtomicBool>) -> Self {
        Self {
            verification,
            host_key_rejected,
        }
    }
}

impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.verification {
            ServerKeyVerification::InsecureAcceptAny => {
                debug!("bastion host key accepted without verification");
                Ok(true)
            }
            ServerKeyVerification::Fingerprint {
                fingerprint: expected,
            } => {
                let fingerprint = server_public_key.fingerprint(ssh_key::HashAlg::Sha256);
                if fingerprint.to_string() == *expected {
                    Ok(true)
                } else {
                    error!(
                        "bastion host key fingerprint mismatch: expected {}, got {}",
                        expected, fingerprint
                    );
                    self.host_key_rejected.store(true, Ordering::SeqCst);
                    Ok(false)
                }
            }
        }
    }
}

fn classify_io(target: &str, e: &io::Error) -> ConnectError {
    let kind = match e.kind() {
        io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Refused,
    };
    ConnectError::new(kind, target, e.to_string())
}

fn classify_ssh(target: &str, e: russh::Error, host_key_rejected: &AtomicBool) -> ConnectError {
    if host_key_rejected.load(Ordering::SeqCst) {
        return ConnectError::new(
            ConnectErrorKind::HostKeyRejected,
            target,
            "bastion host key did not match the configured fingerprint",
        );
    }
    match e {
        russh::Error::IO(ref io) => classify_io(target, io),
        other => ConnectError::new(ConnectErrorKind::Protocol, target, other.to_string()),
    }
}

/// Dial the bastion, run the SSH handshake and authenticate.
///
/// Handshake and authentication are each bounded by `timeout`.
pub(crate) async fn connect(
    config: &TunnelConfig,
    credential: &Credential,
    timeout: Duration,
) -> Result<SshHandle, ConnectError> {
    let target = config.target();
    let ssh_config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });
    let host_key_rejected = Arc::new(AtomicBool::new(false));
    let handler = TunnelClientHandler::new(
        config.server_key_verification.clone(),
        host_key_rejected.clone(),
    );

    let handshake = async {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| classify_io(&target, &e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }
        client::connect_stream(ssh_config, stream, handler)
            .await
            .map_err(|e| classify_ssh(&target, e, &host_key_rejected))
    };

    let mut handle = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| {
            ConnectError::new(
                ConnectErrorKind::Timeout,
                &target,
                format!("no SSH handshake within {:?}", timeout),
            )
        })??;
    debug!("SSH handshake with {} complete", target);

    let auth = tokio::time::timeout(timeout, authenticate(&mut handle, &config.user, credential))
        .await
        .map_err(|_| {
            ConnectError::new(
                ConnectErrorKind::Timeout,
                &target,
                format!("authentication did not finish within {:?}", timeout),
            )
        })?;
    match auth {
        Ok(AuthResult::Success) => {
            debug!("authenticated to {} as {} ({})", target, config.user, credential.kind());
            Ok(handle)
        }
        Ok(AuthResult::Failure { .. }) => Err(ConnectError::new(
            ConnectErrorKind::AuthRejected,
            target,
            format!("bastion rejected {} authentication for {}", credential.kind(), config.user),
        )),
        Err(e) => Err(classify_ssh(&target, e, &host_key_rejected)),
    }
}

async fn authenticate(
    handle: &mut SshHandle,
    user: &str,
    credential: &Credential,
) -> Result<AuthResult, russh::Error> {
    match credential {
        Credential::Password(password) => {
            handle
                .authenticate_password(user, password.expose_secret())
                .await
        }
        Credential::PrivateKey(key) => {
            handle
                .authenticate_publickey(user, Credential::key_with_hash_alg(key))
                .await
        }
    }
}
