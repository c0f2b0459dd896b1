//! A minimal destination that speaks newline-delimited JSON over TCP.
//!
//! Good enough to prove bytes cross the tunnel when no real connector is
//! wired in; schema discovery reports whatever the config declares.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::debug;

use super::{Destination, DestinationRef, Record, Schema, StreamSchema, WriteSummary};
use crate::rewrite::DestinationConfig;

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpProbeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub streams: Vec<StreamSchema>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug)]
pub struct TcpProbeDestination {
    config: TcpProbeConfig,
    name: String,
}

impl TcpProbeDestination {
    pub fn new(config: TcpProbeConfig) -> Self {
        let name = format!("tcp-probe@{}:{}", config.host, config.port);
        Self { config, name }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect to {} timed out", self.name))?
            .with_context(|| format!("connect to {}", self.name))
    }
}

pub fn from_config(config: &DestinationConfig) -> Result<DestinationRef> {
    let config: TcpProbeConfig = serde_json::from_value(config.to_value())
        .context("failed to parse tcp-probe destination config")?;
    Ok(Box::new(TcpProbeDestination::new(config)))
}

#[async_trait]
impl Destination for TcpProbeDestination {
    async fn test_connection(&self) -> Result<()> {
        let mut stream = self.connect().await?;
        stream.shutdown().await.context("close probe connection")?;
        Ok(())
    }

    async fn write(&self, records: &[Record]) -> Result<WriteSummary> {
        let mut stream = self.connect().await?;
        let mut written = 0;
        for record in records {
            let mut line = serde_json::to_vec(record).context("encode record")?;
            line.push(b'\n');
            stream
                .write_all(&line)
                .await
                .with_context(|| format!("write record {} to {}", written, self.name))?;
            written += 1;
        }
        stream.flush().await.context("flush records")?;
        stream.shutdown().await.context("close write connection")?;
        debug!("wrote {} record(s) to {}", written, self.name);
        Ok(WriteSummary {
            records_written: written,
        })
    }

    async fn discover_schema(&self) -> Result<Schema> {
        Ok(Schema {
            streams: self.config.streams.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
