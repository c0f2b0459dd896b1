use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rewrite::DestinationConfig;

pub mod tcp_probe;

/// One row handed to [`Destination::write`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub stream: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub streams: Vec<StreamSchema>,
}

impl Schema {
    pub fn stream(&self, name: &str) -> Option<&StreamSchema> {
        self.streams.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSummary {
    pub records_written: usize,
}

/// The connector under test. Everything behind this trait is external to
/// the harness: SQL, wire protocols and connector business logic.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn test_connection(&self) -> Result<()>;
    async fn write(&self, records: &[Record]) -> Result<WriteSummary>;
    async fn discover_schema(&self) -> Result<Schema>;
    fn name(&self) -> &str;
}

pub type DestinationRef = Box<dyn Destination>;

/// Builds a destination from a (possibly rewritten) config.
pub trait DestinationFactory: Send + Sync {
    fn build(&self, config: &DestinationConfig) -> Result<DestinationRef>;
}

impl<F> DestinationFactory for F
where
    F: Fn(&DestinationConfig) -> Result<DestinationRef> + Send + Sync,
{
    fn build(&self, config: &DestinationConfig) -> Result<DestinationRef> {
        self(config)
    }
}

/// Look up a built-in destination factory by its `type` name.
pub fn from_kind(kind: &str) -> Result<Box<dyn DestinationFactory>> {
    match kind {
        "tcp-probe" => Ok(Box::new(tcp_probe::from_config)),
        name => bail!("unknown destination type: {:?}", name),
    }
}
