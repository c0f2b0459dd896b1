//! Local port forward: a loopback listener whose connections are bridged
//! through `direct-tcpip` channels to the remote endpoint.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Endpoint, client::SshHandle};
use crate::error::{ConnectError, ConnectErrorKind};

/// Counters for one forward. Snapshot of [`ForwardCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub connections: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct ForwardCounters {
    connections: AtomicU64,
    active: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ForwardCounters {
    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connections: self.connections.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A running forward. Dropping it aborts the accept loop and every
/// in-flight connection.
pub(crate) struct ForwardHandle {
    bound: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<ForwardCounters>,
}

impl ForwardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Stop accepting, abort open connections and wait up to `grace` for
    /// the accept loop to wind down.
    pub async fn stop(&mut self, grace: Duration) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!("forward task on {} ended abnormally: {}", self.bound, e),
            Err(_) => {
                warn!("forward task on {} did not stop within {:?}", self.bound, grace);
                abort.abort();
            }
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

pub(crate) async fn start_local_forward(
    handle: Arc<SshHandle>,
    bind: &Endpoint,
    remote: &Endpoint,
) -> Result<ForwardHandle, ConnectError> {
    let listener = TcpListener::bind((bind.host.as_str(), bind.port))
        .await
        .map_err(|e| {
            ConnectError::new(
                ConnectErrorKind::Forward,
                bind.to_string(),
                format!("failed to bind local forward: {}", e),
            )
        })?;
    let bound = listener.local_addr().map_err(|e| {
        ConnectError::new(
            ConnectErrorKind::Forward,
            bind.to_string(),
            format!("failed to read bound address: {}", e),
        )
    })?;
    info!("local forward {} -> {}", bound, remote);

    let cancel = CancellationToken::new();
    let counters = Arc::new(ForwardCounters::default());
    let task = tokio::spawn(accept_loop(
        listener,
        handle,
        remote.clone(),
        counters.clone(),
        cancel.clone(),
    ));

    Ok(ForwardHandle {
        bound,
        cancel,
        task: Some(task),
        counters,
    })
}

async fn accept_loop(
    listener: TcpListener,
    handle: Arc<SshHandle>,
    remote: Endpoint,
    counters: Arc<ForwardCounters>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("forwarding connection from {}", peer);
                    counters.connections.fetch_add(1, Ordering::Relaxed);
                    counters.active.fetch_add(1, Ordering::Relaxed);

                    let handle = handle.clone();
                    let remote = remote.clone();
                    let counters = counters.clone();
                    connections.spawn(async move {
                        if let Err(e) = bridge(&handle, stream, &remote, &counters).await {
                            debug!("forwarded connection from {} ended: {:#}", peer, e);
                        }
                        counters.active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(e) => {
                    warn!("accept error on local forward: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("forwarded connection task panicked: {}", e);
                    }
                }
            }
        }
    }
    drop(listener);
    let in_flight = connections.len();
    connections.shutdown().await;
    counters.active.store(0, Ordering::Relaxed);
    debug!("local forward stopped, aborted {} connection(s)", in_flight);
}

async fn bridge(
    handle: &SshHandle,
    local: TcpStream,
    remote: &Endpoint,
    counters: &ForwardCounters,
) -> Result<()> {
    let channel = handle
        .channel_open_direct_tcpip(remote.host.clone(), remote.port as u32, "127.0.0.1", 0)
        .await
        .with_context(|| format!("open direct-tcpip channel to {}", remote))?;
    let channel = channel.into_stream();

    let (lread, lwrite) = tokio::io::split(local);
    let (cread, cwrite) = tokio::io::split(channel);
    let upstream = copy_stream(lread, "local", cwrite, "channel", &counters.bytes_sent);
    let downstream = copy_stream(cread, "channel", lwrite, "local", &counters.bytes_received);
    tokio::try_join!(upstream, downstream)?;
    Ok(())
}

async fn copy_stream<R, W>(mut r: R, rn: &str, mut w: W, wn: &str, cnt: &AtomicU64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32768];
    loop {
        let len = r
            .read(&mut buf)
            .await
            .with_context(|| format!("read from {}", rn))?;
        if len == 0 {
            break;
        }
        w.write_all(&buf[..len])
            .await
            .with_context(|| format!("write to {}", wn))?;
        w.flush()
            .await
            .with_context(|| format!("flush {} buffer", wn))?;
        cnt.fetch_add(len as u64, Ordering::Relaxed);
    }
    w.shutdown()
        .await
        .with_context(|| format!("shutdown {}", wn))?;
    Ok(())
}
