//! Orchestrates one acceptance run: tunnel, rewrite, suite, teardown.

use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    path::PathBuf,
    time::Instant,
};

use futures::FutureExt;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Timeouts,
    destination::DestinationFactory,
    error::{ConfigError, HarnessError, Phase, SetupError, TimeoutError, TunnelError},
    rewrite::{DestinationConfig, ProxyRewriter},
    suite::{self, CaseOutcome, CaseReport, SuiteSettings},
    tunnel::{
        Endpoint, ForwardStats, RetryPolicy, ServerKeyVerification, TunnelConfig, TunnelMethod,
        TunnelSession,
    },
};

fn default_ssh_port() -> u16 {
    22
}

/// Bastion coordinates and every credential the harness may need. Each
/// [`TunnelMethod`] picks the pieces it uses.
#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TunnelFixture {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub private_key: Option<SecretString>,
    /// Read into `private_key` by [`crate::config::Config::load`].
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<SecretString>,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Where the bastion should connect. Defaults to the destination's
    /// own host/port.
    #[serde(default)]
    pub remote: Option<Endpoint>,
    #[serde(default)]
    pub local_bind: Option<Endpoint>,
    #[serde(default)]
    pub server_key_verification: ServerKeyVerification,
}

impl fmt::Debug for TunnelFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &Option<SecretString>| s.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("TunnelFixture")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &redact(&self.private_key))
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &redact(&self.passphrase))
            .field("password", &redact(&self.password))
            .field("remote", &self.remote)
            .field("local_bind", &self.local_bind)
            .field("server_key_verification", &self.server_key_verification)
            .finish()
    }
}

impl TunnelFixture {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            private_key: None,
            private_key_path: None,
            passphrase: None,
            password: None,
            remote: None,
            local_bind: None,
            server_key_verification: ServerKeyVerification::default(),
        }
    }

    pub fn with_private_key(mut self, key: impl Into<SecretString>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<SecretString>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<SecretString>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_remote(mut self, remote: Endpoint) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_server_key_verification(mut self, verification: ServerKeyVerification) -> Self {
        self.server_key_verification = verification;
        self
    }

    /// Methods this fixture carries credentials for, or just `NO_TUNNEL`.
    pub fn available_methods(&self) -> Vec<TunnelMethod> {
        let mut methods = Vec::new();
        if self.private_key.is_some() || self.private_key_path.is_some() {
            methods.push(TunnelMethod::SshKeyAuth);
        }
        if self.password.is_some() {
            methods.push(TunnelMethod::PasswordAuth);
        }
        if methods.is_empty() {
            methods.push(TunnelMethod::NoTunnel);
        }
        methods
    }
}

/// Outcome of a suite that actually ran.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    pub method: TunnelMethod,
    pub local_endpoint: Option<Endpoint>,
    pub cases: Vec<CaseReport>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_stats: Option<ForwardStats>,
}

impl SuiteReport {
    pub fn case(&self, kind: suite::CaseKind) -> Option<&CaseReport> {
        self.cases.iter().find(|c| c.case == kind)
    }
}

pub struct AcceptanceRunner {
    fixture: TunnelFixture,
    destination: DestinationConfig,
    rewriter: ProxyRewriter,
    timeouts: Timeouts,
    retry: RetryPolicy,
    suite: SuiteSettings,
}

impl AcceptanceRunner {
    pub fn new(fixture: TunnelFixture, destination: DestinationConfig) -> Self {
        Self {
            fixture,
            destination,
            rewriter: ProxyRewriter::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            suite: SuiteSettings::default(),
        }
    }

    pub fn with_rewriter(mut self, rewriter: ProxyRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_suite(mut self, suite: SuiteSettings) -> Self {
        self.suite = suite;
        self
    }

    pub fn destination(&self) -> &DestinationConfig {
        &self.destination
    }

    /// The tunnel config a given method runs with.
    pub fn tunnel_config(&self, method: TunnelMethod) -> Result<TunnelConfig, ConfigError> {
        let f = &self.fixture;
        if method == TunnelMethod::NoTunnel {
            return Ok(TunnelConfig::no_tunnel());
        }
        self.rewriter.fields.validate()?;
        let remote = match &f.remote {
            Some(remote) => remote.clone(),
            None => self.rewriter.endpoint(&self.destination).ok_or_else(|| {
                ConfigError::InvalidRemote("destination config has no host/port".to_string())
            })?,
        };

        let mut config = match method {
            TunnelMethod::SshKeyAuth => {
                let key = f.private_key.clone().ok_or(ConfigError::MissingCredential {
                    method,
                    credential: "a private key",
                })?;
                let mut config =
                    TunnelConfig::ssh_key(f.host.clone(), f.port, f.user.clone(), key, remote);
                config.passphrase = f.passphrase.clone();
                config
            }
            TunnelMethod::PasswordAuth => {
                let password = f.password.clone().ok_or(ConfigError::MissingCredential {
                    method,
                    credential: "a password",
                })?;
                TunnelConfig::password(f.host.clone(), f.port, f.user.clone(), password, remote)
            }
            TunnelMethod::NoTunnel => TunnelConfig::no_tunnel(),
        };
        if let Some(bind) = &f.local_bind {
            config = config.with_local_bind(bind.host.clone(), bind.port);
        }
        config = config.with_server_key_verification(f.server_key_verification.clone());
        config.validate()?;
        Ok(config)
    }

    pub async fn run(
        &self,
        method: TunnelMethod,
        factory: &dyn DestinationFactory,
    ) -> Result<SuiteReport, HarnessError> {
        self.run_with_cancel(method, factory, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        method: TunnelMethod,
        factory: &dyn DestinationFactory,
        cancel: CancellationToken,
    ) -> Result<SuiteReport, HarnessError> {
        if !method.uses_tunnel() {
            info!("running suite against {} directly", self.describe_destination());
            let config = self.rewriter.rewrite_for(&self.destination, None);
            return self
                .run_suite(method, None, &config, factory, None, &cancel)
                .await;
        }

        let setup = |source: TunnelError| SetupError { method, source };
        let config = self
            .tunnel_config(method)
            .map_err(|e| setup(e.into()))?;
        let mut session = TunnelSession::new(config)
            .map_err(|e| setup(e.into()))?
            .with_retry_policy(self.retry.clone())
            .with_timeouts(self.timeouts.clone());

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = session.open() => Some(result),
        };
        let local = match opened {
            Some(Ok(local)) => local,
            Some(Err(e)) => {
                session.close().await;
                return Err(setup(e).into());
            }
            None => {
                info!("{} run cancelled while opening tunnel", method);
                session.close().await;
                return Err(HarnessError::Cancelled {
                    phase: Phase::Connect,
                });
            }
        };

        let config = self.rewriter.rewrite(&self.destination, &local);
        let result = self
            .run_suite(method, Some(local), &config, factory, Some(&mut session), &cancel)
            .await;
        session.close().await;
        result
    }

    /// Run each method in turn, each with its own session.
    pub async fn run_all(
        &self,
        methods: &[TunnelMethod],
        factory: &dyn DestinationFactory,
    ) -> Vec<(TunnelMethod, Result<SuiteReport, HarnessError>)> {
        let mut results = Vec::with_capacity(methods.len());
        for &method in methods {
            let result = self.run(method, factory).await;
            match &result {
                Ok(report) if report.passed => info!("{}: all cases passed", method),
                Ok(_) => warn!("{}: suite had failures", method),
                Err(e) => warn!("{}: run failed during {}: {}", method, e.phase(), e),
            }
            results.push((method, result));
        }
        results
    }

    fn describe_destination(&self) -> String {
        self.rewriter
            .endpoint(&self.destination)
            .map(|e| e.to_string())
            .unwrap_or_else(|| "destination".to_string())
    }

    async fn run_suite(
        &self,
        method: TunnelMethod,
        local: Option<Endpoint>,
        config: &DestinationConfig,
        factory: &dyn DestinationFactory,
        mut session: Option<&mut TunnelSession>,
        cancel: &CancellationToken,
    ) -> Result<SuiteReport, HarnessError> {
        let destination = match std::panic::catch_unwind(AssertUnwindSafe(|| factory.build(config)))
        {
            Ok(Ok(destination)) => destination,
            Ok(Err(e)) => return Err(HarnessError::Destination(e)),
            Err(panic) => {
                return Err(HarnessError::Destination(anyhow::anyhow!(
                    "destination factory panicked: {}",
                    panic_message(panic)
                )));
            }
        };

        let mut cases = Vec::with_capacity(self.suite.cases.len());
        for &kind in &self.suite.cases {
            let started = Instant::now();
            let body = AssertUnwindSafe(suite::run_case(kind, destination.as_ref(), &self.suite))
                .catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("{} run cancelled during {}", method, kind);
                    return Err(HarnessError::Cancelled { phase: Phase::SuiteExecution });
                }
                result = tokio::time::timeout(self.timeouts.operation(), body) => match result {
                    Ok(Ok(Ok(()))) => CaseOutcome::Passed,
                    Ok(Ok(Err(e))) => CaseOutcome::Failed { reason: format!("{:#}", e) },
                    Ok(Err(panic)) => CaseOutcome::Failed {
                        reason: format!("case panicked: {}", panic_message(panic)),
                    },
                    Err(_) => {
                        let err = TimeoutError {
                            operation: kind.to_string(),
                            after: self.timeouts.operation(),
                        };
                        if let Some(session) = session.as_deref_mut() {
                            session.mark_failed();
                        }
                        CaseOutcome::timed_out(&err)
                    }
                },
            };
            match &outcome {
                CaseOutcome::Passed => {
                    info!("{} {} on {}: passed", method, kind, destination.name())
                }
                CaseOutcome::TimedOut { message, .. } => {
                    warn!("{} {} on {}: {}", method, kind, destination.name(), message)
                }
                other => warn!("{} {} on {}: {:?}", method, kind, destination.name(), other),
            }
            cases.push(CaseReport {
                case: kind,
                outcome,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        Ok(SuiteReport {
            method,
            local_endpoint: local,
            passed: cases.iter().all(|c| c.outcome.is_passed()),
            cases,
            forward_stats: session.as_ref().and_then(|s| s.stats()),
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
