use std::{fmt, str::FromStr};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ConfigError, rewrite::EndpointFields};

fn default_ssh_port() -> u16 {
    22
}

fn default_local_bind() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

/// Which way the harness reaches the destination.
///
/// This is a closed set: adding a method means adding a variant here and
/// handling it in [`super::auth::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelMethod {
    #[serde(rename = "SSH_KEY_AUTH")]
    SshKeyAuth,
    #[serde(rename = "SSH_PASSWORD_AUTH", alias = "PASSWORD_AUTH")]
    PasswordAuth,
    #[serde(rename = "NO_TUNNEL")]
    NoTunnel,
}

impl TunnelMethod {
    pub const ALL: [TunnelMethod; 3] = [
        TunnelMethod::SshKeyAuth,
        TunnelMethod::PasswordAuth,
        TunnelMethod::NoTunnel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMethod::SshKeyAuth => "SSH_KEY_AUTH",
            TunnelMethod::PasswordAuth => "SSH_PASSWORD_AUTH",
            TunnelMethod::NoTunnel => "NO_TUNNEL",
        }
    }

    pub fn uses_tunnel(&self) -> bool {
        !matches!(self, TunnelMethod::NoTunnel)
    }
}

impl fmt::Display for TunnelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SSH_KEY_AUTH" | "ssh-key" | "key" => Ok(TunnelMethod::SshKeyAuth),
            "SSH_PASSWORD_AUTH" | "PASSWORD_AUTH" | "password" => Ok(TunnelMethod::PasswordAuth),
            "NO_TUNNEL" | "none" | "direct" => Ok(TunnelMethod::NoTunnel),
            other => Err(ConfigError::InvalidTunnelBlock(format!(
                "unknown tunnel method {:?}",
                other
            ))),
        }
    }
}

/// A host/port pair. Used both for the remote database endpoint as seen
/// from the bastion and for the local forward the harness binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

pub type RemoteEndpoint = Endpoint;
pub type LocalEndpoint = Endpoint;

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum ServerKeyVerification {
    #[serde(rename = "fingerprint")]
    Fingerprint { fingerprint: String },
    #[serde(rename = "insecureAcceptAny")]
    #[default]
    InsecureAcceptAny,
}

/// Immutable description of how to reach the bastion and what to forward.
#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub method: TunnelMethod,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub private_key: Option<SecretString>,
    #[serde(default)]
    pub passphrase: Option<SecretString>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub remote: RemoteEndpoint,
    #[serde(default = "default_local_bind")]
    pub local_bind: Endpoint,
    #[serde(default)]
    pub server_key_verification: ServerKeyVerification,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &Option<SecretString>| s.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("TunnelConfig")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &redact(&self.private_key))
            .field("passphrase", &redact(&self.passphrase))
            .field("password", &redact(&self.password))
            .field("remote", &self.remote)
            .field("local_bind", &self.local_bind)
            .field("server_key_verification", &self.server_key_verification)
            .finish()
    }
}

impl TunnelConfig {
    fn base(method: TunnelMethod, host: String, port: u16, user: String, remote: Endpoint) -> Self {
        Self {
            method,
            host,
            port,
            user,
            private_key: None,
            passphrase: None,
            password: None,
            remote,
            local_bind: default_local_bind(),
            server_key_verification: ServerKeyVerification::default(),
        }
    }

    /// Key-based tunnel. `private_key` is the PEM/OpenSSH text, not a path.
    pub fn ssh_key(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        private_key: impl Into<SecretString>,
        remote: RemoteEndpoint,
    ) -> Self {
        let mut cfg = Self::base(
            TunnelMethod::SshKeyAuth,
            host.into(),
            port,
            user.into(),
            remote,
        );
        cfg.private_key = Some(private_key.into());
        cfg
    }

    pub fn password(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<SecretString>,
        remote: RemoteEndpoint,
    ) -> Self {
        let mut cfg = Self::base(
            TunnelMethod::PasswordAuth,
            host.into(),
            port,
            user.into(),
            remote,
        );
        cfg.password = Some(password.into());
        cfg
    }

    pub fn no_tunnel() -> Self {
        Self::base(
            TunnelMethod::NoTunnel,
            String::new(),
            default_ssh_port(),
            String::new(),
            Endpoint::default(),
        )
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<SecretString>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Local address for the forward listener; port 0 picks an ephemeral port.
    pub fn with_local_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_bind = Endpoint::new(host, port);
        self
    }

    pub fn with_server_key_verification(mut self, verification: ServerKeyVerification) -> Self {
        self.server_key_verification = verification;
        self
    }

    pub fn target(&self) -> String {
        Endpoint::new(self.host.clone(), self.port).to_string()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.method == TunnelMethod::NoTunnel {
            if self.private_key.is_some() || self.password.is_some() || self.passphrase.is_some()
            {
                return Err(ConfigError::UnexpectedCredential(self.method));
            }
            return Ok(());
        }

        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.private_key.is_some() && self.password.is_some() {
            return Err(ConfigError::ConflictingCredentials);
        }
        match self.method {
            TunnelMethod::SshKeyAuth if self.private_key.is_none() => {
                return Err(ConfigError::MissingCredential {
                    method: self.method,
                    credential: "a private key",
                });
            }
            TunnelMethod::PasswordAuth if self.password.is_none() => {
                return Err(ConfigError::MissingCredential {
                    method: self.method,
                    credential: "a password",
                });
            }
            _ => {}
        }
        if !self.remote.is_valid() {
            return Err(ConfigError::InvalidRemote(self.remote.to_string()));
        }
        Ok(())
    }

    /// Parse the `tunnel_method` block a destination config may embed.
    ///
    /// The remote endpoint is taken from the destination's own host/port
    /// fields. A config without the block connects directly.
    pub fn from_destination_json(
        destination: &Value,
        fields: &EndpointFields,
    ) -> Result<Self, ConfigError> {
        let block = match destination.get("tunnel_method") {
            None | Some(Value::Null) => return Ok(Self::no_tunnel()),
            Some(Value::Object(block)) => block,
            Some(_) => {
                return Err(ConfigError::InvalidTunnelBlock(
                    "tunnel_method must be an object".to_string(),
                ));
            }
        };

        let str_field = |key: &str| block.get(key).and_then(Value::as_str).map(str::to_owned);

        let method: TunnelMethod = str_field("tunnel_method")
            .ok_or_else(|| {
                ConfigError::InvalidTunnelBlock("missing tunnel_method.tunnel_method".to_string())
            })?
            .parse()?;
        if method == TunnelMethod::NoTunnel {
            return Ok(Self::no_tunnel());
        }

        let port = match block.get("tunnel_port") {
            None | Some(Value::Null) => default_ssh_port(),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| ConfigError::InvalidTunnelBlock(format!("bad tunnel_port {}", n)))?,
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| ConfigError::InvalidTunnelBlock(format!("bad tunnel_port {:?}", s)))?,
            Some(other) => {
                return Err(ConfigError::InvalidTunnelBlock(format!(
                    "bad tunnel_port {}",
                    other
                )));
            }
        };

        let remote = fields.read(destination).ok_or_else(|| {
            ConfigError::InvalidRemote("destination has no readable host/port".to_string())
        })?;

        let mut cfg = Self::base(
            method,
            str_field("tunnel_host").unwrap_or_default(),
            port,
            str_field("tunnel_user").unwrap_or_default(),
            remote,
        );
        cfg.private_key = str_field("ssh_key").map(SecretString::from);
        cfg.password = str_field("tunnel_user_password").map(SecretString::from);
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn password_is_empty(&self) -> bool {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().is_empty())
            .unwrap_or(true)
    }
}
