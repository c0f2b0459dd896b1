use std::{fmt, sync::Arc};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    Credential, Endpoint, ForwardStats, RetryPolicy, TunnelConfig, auth,
    client::{self, SshHandle},
    forward::{self, ForwardHandle},
};
use crate::{
    config::Timeouts,
    error::{AuthError, AuthErrorKind, ConfigError, ConnectError, Phase, StateError, TunnelError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct ActiveTunnel {
    handle: Arc<SshHandle>,
    forward: ForwardHandle,
    local: Endpoint,
}

/// One SSH connection plus the local forward riding on it.
///
/// Lifecycle: `Closed -> Opening -> Open | Failed`, and `close()` always
/// brings it back to `Closed`. A failed session is not reopened in place.
pub struct TunnelSession {
    config: TunnelConfig,
    retry: RetryPolicy,
    timeouts: Timeouts,
    state: SessionState,
    active: Option<ActiveTunnel>,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("method", &self.config.method)
            .field("bastion", &self.config.target())
            .field("remote", &self.config.remote)
            .field("state", &self.state)
            .field("local", &self.active.as_ref().map(|a| &a.local))
            .finish()
    }
}

impl TunnelSession {
    pub fn new(config: TunnelConfig) -> Result<Self, ConfigError> {
        if !config.method.uses_tunnel() {
            return Err(ConfigError::DirectConnection);
        }
        config.validate()?;
        Ok(Self {
            config,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            state: SessionState::Closed,
            active: None,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.config.remote
    }

    pub fn local_endpoint(&self) -> Result<Endpoint, StateError> {
        match (&self.state, &self.active) {
            (SessionState::Open, Some(active)) => Ok(active.local.clone()),
            _ => Err(StateError {
                operation: "read local endpoint",
                state: self.state,
                phase: Phase::SuiteExecution,
            }),
        }
    }

    pub fn stats(&self) -> Option<ForwardStats> {
        self.active.as_ref().map(|a| a.forward.stats())
    }

    /// Resolve the credential, connect, authenticate and start forwarding.
    pub async fn open(&mut self) -> Result<Endpoint, TunnelError> {
        self.begin_open()?;

        // bcrypt key decryption is CPU-bound
        let config = self.config.clone();
        let resolved = tokio::task::spawn_blocking(move || auth::resolve(&config)).await;
        let credential = match resolved {
            Ok(Ok(Some(credential))) => credential,
            Ok(Ok(None)) => return Err(self.fail(ConfigError::DirectConnection.into())),
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Err(e) => {
                let err = AuthError::new(
                    AuthErrorKind::InvalidKey,
                    format!("credential resolution task failed: {}", e),
                );
                return Err(self.fail(err.into()));
            }
        };
        self.establish(credential).await
    }

    /// Like [`open`](Self::open) with a credential resolved by the caller.
    pub async fn open_with(&mut self, credential: Credential) -> Result<Endpoint, TunnelError> {
        self.begin_open()?;
        self.establish(credential).await
    }

    /// Flag an open session as unusable, e.g. after a suite operation
    /// timed out on it. Resources stay held until [`close`](Self::close).
    pub fn mark_failed(&mut self) {
        if self.state == SessionState::Open {
            warn!("tunnel to {} marked failed", self.config.remote);
            self.state = SessionState::Failed;
        }
    }

    /// Tear everything down. Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        let prior = self.state;
        if let Some(mut active) = self.active.take() {
            active.forward.stop(self.timeouts.teardown()).await;
            self.disconnect(&active.handle, "tunnel closed").await;
            info!("tunnel {} -> {} closed", active.local, self.config.remote);
        } else if prior != SessionState::Closed {
            debug!("closing {} session with nothing to tear down", prior);
        }
        self.state = SessionState::Closed;
    }

    /// Bounded by the teardown timeout; failures are logged, never returned.
    async fn disconnect(&self, handle: &SshHandle, reason: &str) {
        let disconnect = handle.disconnect(russh::Disconnect::ByApplication, reason, "en");
        match tokio::time::timeout(self.timeouts.teardown(), disconnect).await {
            Ok(Ok(())) => debug!("disconnected from {}", self.config.target()),
            Ok(Err(e)) => warn!("error disconnecting from {}: {}", self.config.target(), e),
            Err(_) => warn!(
                "disconnect from {} timed out after {:?}",
                self.config.target(),
                self.timeouts.teardown()
            ),
        }
    }

    fn begin_open(&mut self) -> Result<(), StateError> {
        if self.state != SessionState::Closed {
            return Err(StateError {
                operation: "open",
                state: self.state,
                phase: Phase::Connect,
            });
        }
        self.state = SessionState::Opening;
        Ok(())
    }

    fn fail(&mut self, err: TunnelError) -> TunnelError {
        warn!(
            "{} tunnel to {} failed during {}: {}",
            self.config.method,
            self.config.target(),
            err.phase(),
            err
        );
        self.state = SessionState::Failed;
        err
    }

    async fn establish(&mut self, credential: Credential) -> Result<Endpoint, TunnelError> {
        info!(
            "opening {} tunnel via {} to {}",
            self.config.method,
            self.config.target(),
            self.config.remote
        );
        let handle = match self.connect_with_retry(&credential).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => return Err(self.fail(e.into())),
        };

        let forward = match forward::start_local_forward(
            handle.clone(),
            &self.config.local_bind,
            &self.config.remote,
        )
        .await
        {
            Ok(forward) => forward,
            Err(e) => {
                self.disconnect(&handle, "local forward failed").await;
                return Err(self.fail(e.into()));
            }
        };

        let local = Endpoint::from(forward.local_addr());
        self.active = Some(ActiveTunnel {
            handle,
            forward,
            local: local.clone(),
        });
        self.state = SessionState::Open;
        info!("tunnel open: {} -> {}", local, self.config.remote);
        Ok(local)
    }

    async fn connect_with_retry(&self, credential: &Credential) -> Result<SshHandle, ConnectError> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 1;
        loop {
            match client::connect(&self.config, credential, self.timeouts.connect()).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retriable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "connect attempt {}/{} failed: {}; retrying in {:?}",
                            attempt,
                            self.retry.max_attempts(),
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            warn!(
                "tunnel session to {} dropped without close; aborting forward",
                self.config.remote
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectErrorKind;
    use crate::tunnel::TunnelMethod;

    fn config() -> TunnelConfig {
        TunnelConfig::password("127.0.0.1", 1, "t", "pw", Endpoint::new("db", 5432))
    }

    #[test]
    fn test_new_validates() {
        let mut cfg = config();
        cfg.host = String::new();
        assert_eq!(TunnelSession::new(cfg).unwrap_err(), ConfigError::EmptyHost);
        assert_eq!(
            TunnelSession::new(TunnelConfig::no_tunnel()).unwrap_err(),
            ConfigError::DirectConnection
        );
        let session = TunnelSession::new(config()).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.remote_endpoint(), &Endpoint::new("db", 5432));
    }

    #[test]
    fn test_local_endpoint_requires_open() {
        let session = TunnelSession::new(config()).unwrap();
        let err = session.local_endpoint().unwrap_err();
        assert_eq!(err.state, SessionState::Closed);
        assert_eq!(TunnelError::from(err).phase(), Phase::SuiteExecution);
        assert!(session.stats().is_none());
    }

    #[tokio::test]
    async fn test_empty_password_fails_before_network() {
        let mut cfg = config();
        cfg.password = Some("".into());
        let mut session = TunnelSession::new(cfg).unwrap();
        let err = session.open().await.unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthErrorKind::EmptyPassword));
        assert_eq!(session.state(), SessionState::Failed);

        // Failed -> open is not allowed
        let err = session.open().await.unwrap_err();
        assert!(matches!(err, TunnelError::State(_)));
        assert_eq!(err.phase(), Phase::Connect);

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_refused_without_retry() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config();
        cfg.port = port;
        assert_eq!(cfg.method, TunnelMethod::PasswordAuth);
        let mut session = TunnelSession::new(cfg)
            .unwrap()
            .with_retry_policy(RetryPolicy::no_retry());
        let err = session.open().await.unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
        assert_eq!(session.state(), SessionState::Failed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_mark_failed_only_from_open() {
        let mut session = TunnelSession::new(config()).unwrap();
        session.mark_failed();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
