//! Point a destination config at the local end of a tunnel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::ConfigError,
    tunnel::{Endpoint, LocalEndpoint},
};

/// Opaque connector parameters. Always a JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationConfig(Map<String, Value>);

impl DestinationConfig {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => anyhow::bail!("destination config must be an object, got {}", other),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn set_path(&mut self, path: &[String], new_value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut map = &mut self.0;
        for key in parents {
            let entry = map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = match entry {
                Value::Object(m) => m,
                _ => return,
            };
        }
        map.insert(last.clone(), new_value);
    }
}

impl From<Map<String, Value>> for DestinationConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn default_host_path() -> Vec<String> {
    vec!["host".to_string()]
}

fn default_port_path() -> Vec<String> {
    vec!["port".to_string()]
}

/// Where host and port live inside a destination config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointFields {
    #[serde(default = "default_host_path")]
    pub host: Vec<String>,
    #[serde(default = "default_port_path")]
    pub port: Vec<String>,
}

impl Default for EndpointFields {
    fn default() -> Self {
        Self {
            host: default_host_path(),
            port: default_port_path(),
        }
    }
}

impl EndpointFields {
    pub fn nested(host: &[&str], port: &[&str]) -> Self {
        Self {
            host: host.iter().map(|s| s.to_string()).collect(),
            port: port.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Both paths must name a field, otherwise a rewrite would leave the
    /// destination pointing past the tunnel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyFieldPath("host"));
        }
        if self.port.is_empty() {
            return Err(ConfigError::EmptyFieldPath("port"));
        }
        Ok(())
    }

    /// Read (host, port) from raw JSON. Ports may be numbers or numeric strings.
    pub fn read(&self, value: &Value) -> Option<Endpoint> {
        let lookup = |path: &[String]| {
            path.iter()
                .try_fold(value, |v, key| v.get(key.as_str()))
        };
        let host = lookup(&self.host)?.as_str()?;
        let port = match lookup(&self.port)? {
            Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Endpoint::new(host, port))
    }
}

/// Derives destination configs that connect through a local forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRewriter {
    #[serde(default)]
    pub fields: EndpointFields,
    /// Drop the embedded `tunnel_method` block so the connector does not
    /// try to open its own tunnel on top of ours.
    #[serde(default)]
    pub strip_tunnel_block: bool,
}

impl ProxyRewriter {
    pub fn new(fields: EndpointFields) -> Self {
        Self {
            fields,
            strip_tunnel_block: false,
        }
    }

    pub fn strip_tunnel_block(mut self, strip: bool) -> Self {
        self.strip_tunnel_block = strip;
        self
    }

    pub fn rewrite(&self, config: &DestinationConfig, local: &LocalEndpoint) -> DestinationConfig {
        let mut out = config.clone();
        out.set_path(&self.fields.host, Value::String(local.host.clone()));
        out.set_path(&self.fields.port, Value::from(local.port));
        if self.strip_tunnel_block {
            out.0.remove("tunnel_method");
        }
        out
    }

    /// `None` means a direct connection: the config is returned unchanged.
    pub fn rewrite_for(
        &self,
        config: &DestinationConfig,
        local: Option<&LocalEndpoint>,
    ) -> DestinationConfig {
        match local {
            Some(local) => self.rewrite(config, local),
            None => config.clone(),
        }
    }

    pub fn endpoint(&self, config: &DestinationConfig) -> Option<Endpoint> {
        self.fields.read(&config.to_value())
    }
}
