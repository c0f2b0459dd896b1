use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    destination,
    rewrite::{DestinationConfig, ProxyRewriter},
    runner::{AcceptanceRunner, TunnelFixture},
    suite::SuiteSettings,
    tunnel::{RetryPolicy, TunnelMethod},
};

fn default_destination_kind() -> String {
    "tcp-probe".to_string()
}

/// The harness configuration file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub tunnel: TunnelFixture,
    pub destination: DestinationSection,
    /// Methods to run when none are given on the command line. Empty means
    /// every method the fixture has credentials for.
    #[serde(default)]
    pub methods: Vec<TunnelMethod>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub suite: SuiteSettings,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSection {
    #[serde(rename = "type", default = "default_destination_kind")]
    pub kind: String,
    #[serde(default)]
    pub rewrite: ProxyRewriter,
    pub config: DestinationConfig,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let s = tokio::fs::read(path)
            .await
            .with_context(|| format!("read config file {}", path))?;
        let s = String::from_utf8(s).context("parse utf8")?;
        let mut cfg: Config = serde_yaml_ng::from_str(&s).context("parse yaml")?;
        let base = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
        cfg.load_key_file(base).await?;
        Ok(cfg)
    }

    async fn load_key_file(&mut self, base: &Path) -> Result<()> {
        let Some(path) = self.tunnel.private_key_path.clone() else {
            return Ok(());
        };
        if self.tunnel.private_key.is_some() {
            bail!("tunnel.privateKey and tunnel.privateKeyPath are mutually exclusive");
        }
        let path: PathBuf = if path.is_absolute() {
            path
        } else {
            base.join(path)
        };
        let key = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read private key {}", path.display()))?;
        debug!("loaded private key from {}", path.display());
        self.tunnel.private_key = Some(key.into());
        Ok(())
    }

    pub fn runner(&self) -> AcceptanceRunner {
        AcceptanceRunner::new(self.tunnel.clone(), self.destination.config.clone())
            .with_rewriter(self.destination.rewrite.clone())
            .with_timeouts(self.timeouts.clone())
            .with_retry_policy(self.retry.clone())
            .with_suite(self.suite.clone())
    }

    pub fn methods(&self) -> Vec<TunnelMethod> {
        if self.methods.is_empty() {
            self.tunnel.available_methods()
        } else {
            self.methods.clone()
        }
    }

    /// Check everything that can be checked without touching the network.
    pub fn verify(&self, methods: &[TunnelMethod]) -> Result<()> {
        destination::from_kind(&self.destination.kind)?;
        if methods.is_empty() {
            bail!("no tunnel method selected and the fixture has no credentials");
        }
        let runner = self.runner();
        for method in methods {
            runner
                .tunnel_config(*method)
                .with_context(|| format!("invalid {} tunnel config", method))?;
        }
        if self.suite.cases.is_empty() {
            bail!("suite.cases is empty");
        }
        Ok(())
    }
}

fn default_connect_ms() -> u64 {
    30_000
}
fn default_operation_ms() -> u64 {
    120_000
}
fn default_teardown_ms() -> u64 {
    5_000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Per connect attempt: TCP dial, handshake and authentication each.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Per suite case.
    #[serde(default = "default_operation_ms")]
    pub operation_ms: u64,
    #[serde(default = "default_teardown_ms")]
    pub teardown_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect_ms: default_connect_ms(),
            operation_ms: default_operation_ms(),
            teardown_ms: default_teardown_ms(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn teardown(&self) -> Duration {
        Duration::from_millis(self.teardown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tunnel:
  host: bastion.internal
  user: tunnel
  password: s3cret
destination:
  config:
    host: oracle-db
    port: 1521
    sid: ORCLCDB
timeouts:
  operationMs: 2000
"#;

    #[test]
    fn test_parse_sample() {
        let cfg: Config = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.tunnel.port, 22);
        assert_eq!(cfg.destination.kind, "tcp-probe");
        assert_eq!(cfg.timeouts.operation(), Duration::from_secs(2));
        assert_eq!(cfg.timeouts.connect(), Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.methods(), vec![TunnelMethod::PasswordAuth]);
        cfg.verify(&cfg.methods()).unwrap();
        assert!(!format!("{:?}", cfg).contains("s3cret"));
    }

    #[test]
    fn test_parse_demo_config() {
        let cfg: Config =
            serde_yaml_ng::from_str(include_str!("../demos/harness.yaml")).unwrap();
        assert_eq!(
            cfg.methods(),
            vec![TunnelMethod::SshKeyAuth, TunnelMethod::NoTunnel]
        );
        assert_eq!(
            cfg.tunnel.private_key_path.as_deref(),
            Some(Path::new("keys/id_ed25519"))
        );
        assert!(cfg.destination.rewrite.strip_tunnel_block);
        assert_eq!(cfg.suite.batch_size, 10);
    }

    #[test]
    fn test_verify_reports_missing_key() {
        let cfg: Config = serde_yaml_ng::from_str(SAMPLE).unwrap();
        let err = cfg.verify(&[TunnelMethod::SshKeyAuth]).unwrap_err();
        assert!(format!("{:#}", err).contains("SSH_KEY_AUTH"), "{:#}", err);
    }

    #[test]
    fn test_verify_rejects_empty_rewrite_path() {
        let mut cfg: Config = serde_yaml_ng::from_str(SAMPLE).unwrap();
        cfg.destination.rewrite.fields.host.clear();
        let err = cfg.verify(&cfg.methods()).unwrap_err();
        assert!(format!("{:#}", err).contains("field path for host"), "{:#}", err);
    }

    #[test]
    fn test_verify_unknown_destination() {
        let mut cfg: Config = serde_yaml_ng::from_str(SAMPLE).unwrap();
        cfg.destination.kind = "mystery".into();
        assert!(cfg.verify(&cfg.methods()).is_err());
    }
}
