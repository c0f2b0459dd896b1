//! SSH tunnels to a bastion host with a local port forward to the database
//! endpoint behind it.

pub mod auth;
mod client;
mod config;
mod forward;
mod retry;
mod session;

pub use auth::Credential;
pub use config::{
    Endpoint, LocalEndpoint, RemoteEndpoint, ServerKeyVerification, TunnelConfig, TunnelMethod,
};
pub use forward::ForwardStats;
pub use retry::{Backoff, RetryPolicy};
pub use session::{SessionState, TunnelSession};
