//! Error taxonomy for tunnel setup, suite execution and teardown.
//!
//! Every externally visible failure can report the [`Phase`] that produced it,
//! so a report line can say whether config validation, authentication, the
//! network, a suite case or teardown went wrong.

use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::tunnel::{SessionState, TunnelMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    ConfigValidation,
    Auth,
    Connect,
    SuiteExecution,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::ConfigValidation => "config validation",
            Phase::Auth => "auth",
            Phase::Connect => "connect",
            Phase::SuiteExecution => "suite execution",
            Phase::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Malformed or missing tunnel parameters, detected before any network activity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tunnel host is empty")]
    EmptyHost,
    #[error("tunnel port must not be 0")]
    ZeroPort,
    #[error("{method} requires {credential} but none was provided")]
    MissingCredential {
        method: TunnelMethod,
        credential: &'static str,
    },
    #[error("both password and private key are set; exactly one is allowed")]
    ConflictingCredentials,
    #[error("{0} must not carry tunnel credentials")]
    UnexpectedCredential(TunnelMethod),
    #[error("remote endpoint is invalid: {0}")]
    InvalidRemote(String),
    #[error("invalid tunnel_method block: {0}")]
    InvalidTunnelBlock(String),
    #[error("NO_TUNNEL connects directly and has no tunnel session")]
    DirectConnection,
    #[error("rewrite field path for {0} is empty")]
    EmptyFieldPath(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthErrorKind {
    InvalidKey,
    BadPassphrase,
    EmptyPassword,
}

/// Credential-specific failures raised while resolving the auth strategy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectErrorKind {
    Timeout,
    Refused,
    AuthRejected,
    HostKeyRejected,
    Protocol,
    Forward,
}

impl ConnectErrorKind {
    /// Only network-level transients are worth another attempt.
    pub fn is_retriable(self) -> bool {
        matches!(self, ConnectErrorKind::Timeout | ConnectErrorKind::Refused)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} connecting to {target}: {message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub target: String,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// An operation was invoked in a session state that does not allow it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {operation} while session is {state:?}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: SessionState,
    /// Phase the rejected operation belongs to.
    pub phase: Phase,
}

/// A suite operation exceeded its deadline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} timed out after {after:?}")]
pub struct TimeoutError {
    pub operation: String,
    pub after: Duration,
}

impl TimeoutError {
    pub fn phase(&self) -> Phase {
        Phase::SuiteExecution
    }
}

/// Everything a tunnel session can fail with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl TunnelError {
    pub fn phase(&self) -> Phase {
        match self {
            TunnelError::Config(_) => Phase::ConfigValidation,
            TunnelError::Auth(_) => Phase::Auth,
            TunnelError::Connect(_) => Phase::Connect,
            TunnelError::State(e) => e.phase,
        }
    }

    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            TunnelError::Connect(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn auth_kind(&self) -> Option<AuthErrorKind> {
        match self {
            TunnelError::Auth(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// The tunnel never reached the open state; the dependent suite was not run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{method} tunnel setup failed during {}: {source}", .source.phase())]
pub struct SetupError {
    pub method: TunnelMethod,
    #[source]
    pub source: TunnelError,
}

impl SetupError {
    pub fn phase(&self) -> Phase {
        self.source.phase()
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("failed to build destination: {0:#}")]
    Destination(anyhow::Error),
    #[error("run cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl HarnessError {
    pub fn phase(&self) -> Phase {
        match self {
            HarnessError::Setup(e) => e.phase(),
            HarnessError::Destination(_) => Phase::SuiteExecution,
            HarnessError::Cancelled { phase } => *phase,
        }
    }
}
