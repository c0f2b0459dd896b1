//! SSH tunnel acceptance harness.
//!
//! Opens an SSH tunnel to a bastion host, forwards a local port to the
//! database behind it, points a destination connector at that port and runs
//! a fixed acceptance suite, tearing the tunnel down on every exit path.

pub mod cli;
pub mod config;
pub mod destination;
pub mod error;
pub mod rewrite;
pub mod runner;
pub mod suite;
pub mod tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use error::{HarnessError, Phase};
pub use runner::{AcceptanceRunner, SuiteReport, TunnelFixture};
pub use tunnel::{TunnelConfig, TunnelMethod, TunnelSession};
