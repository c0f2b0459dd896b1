//! The fixed acceptance cases run against a destination.

use std::fmt;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    destination::{Destination, Record},
    error::{Phase, TimeoutError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    ConnectivityCheck,
    WriteRoundTrip,
    SchemaIntrospection,
}

impl CaseKind {
    pub const ALL: [CaseKind; 3] = [
        CaseKind::ConnectivityCheck,
        CaseKind::WriteRoundTrip,
        CaseKind::SchemaIntrospection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseKind::ConnectivityCheck => "connectivity_check",
            CaseKind::WriteRoundTrip => "write_round_trip",
            CaseKind::SchemaIntrospection => "schema_introspection",
        }
    }
}

impl fmt::Display for CaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CaseOutcome {
    Passed,
    Failed {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TimedOut {
        after_ms: u64,
        phase: Phase,
        message: String,
    },
}

impl CaseOutcome {
    pub fn timed_out(err: &TimeoutError) -> Self {
        CaseOutcome::TimedOut {
            after_ms: err.after.as_millis() as u64,
            phase: err.phase(),
            message: err.to_string(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseReport {
    pub case: CaseKind,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
    pub elapsed_ms: u64,
}

fn default_stream() -> String {
    "tunnel_acceptance".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_cases() -> Vec<CaseKind> {
    CaseKind::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSettings {
    /// Stream the write round-trip targets and schema introspection expects.
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cases")]
    pub cases: Vec<CaseKind>,
}

impl Default for SuiteSettings {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            batch_size: default_batch_size(),
            cases: default_cases(),
        }
    }
}

/// The deterministic batch written by the round-trip case.
pub fn sample_records(stream: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record {
            stream: stream.to_string(),
            data: json!({
                "id": i,
                "name": format!("record-{}", i),
                "payload": "x".repeat(i % 7),
            }),
        })
        .collect()
}

pub async fn run_case(kind: CaseKind, destination: &dyn Destination, settings: &SuiteSettings) -> Result<()> {
    match kind {
        CaseKind::ConnectivityCheck => destination.test_connection().await,
        CaseKind::WriteRoundTrip => {
            let records = sample_records(&settings.stream, settings.batch_size);
            let summary = destination.write(&records).await?;
            ensure!(
                summary.records_written == records.len(),
                "destination accepted {} of {} records",
                summary.records_written,
                records.len()
            );
            Ok(())
        }
        CaseKind::SchemaIntrospection => {
            let schema = destination.discover_schema().await?;
            if schema.stream(&settings.stream).is_none() {
                let found: Vec<_> = schema.streams.iter().map(|s| s.name.as_str()).collect();
                bail!(
                    "stream {:?} missing from discovered schema (found {:?})",
                    settings.stream,
                    found
                );
            }
            Ok(())
        }
    }
}
