//! Request-scoped pool of tool-server clients.
//!
//! One pool per turn. Connections are opened concurrently with an individual
//! timeout each; a server that fails to resolve or connect is recorded and
//! dropped, never fatal to the turn. Teardown is single-fire: the normal
//! completion path and the cancellation path may race, and exactly one of
//! them closes the connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{McpClient, McpError, ToolServer};
use crate::transport::{self, ServerDescriptor};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on each individual connection attempt (resolution + handshake).
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One descriptor that did not make it into the pool.
pub struct ConnectFailure {
    pub descriptor: ServerDescriptor,
    pub error: McpError,
}

struct PoolInner {
    servers: Vec<Arc<dyn ToolServer>>,
    closed: AtomicBool,
}

/// The set of live clients for one turn. Cheap to clone; all clones share
/// the same single-fire close guard.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    /// Open one client per descriptor, concurrently, each attempt bounded by
    /// `config.connect_timeout` and by `cancel`.
    ///
    /// Handles come back in descriptor order regardless of which connection
    /// completed first — merge order downstream depends on it. Before
    /// returning, teardown is registered on `cancel`, so an abort that
    /// arrives mid-tool-call still closes every handle.
    pub async fn open(
        descriptors: Vec<ServerDescriptor>,
        config: &PoolConfig,
        cancel: CancellationToken,
    ) -> (ClientPool, Vec<ConnectFailure>) {
        let mut tasks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let timeout = config.connect_timeout;
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let result = connect_one(&descriptor, timeout, &cancel).await;
                (descriptor, result)
            }));
        }

        let mut servers: Vec<Arc<dyn ToolServer>> = Vec::new();
        let mut failures = Vec::new();
        for task in tasks {
            match task.await {
                Ok((descriptor, Ok(client))) => {
                    tracing::debug!(server = descriptor.label(), "tool server connected");
                    servers.push(Arc::new(client));
                }
                Ok((descriptor, Err(error))) => {
                    tracing::warn!(
                        server = descriptor.label(),
                        error = %error,
                        "tool server skipped"
                    );
                    failures.push(ConnectFailure { descriptor, error });
                }
                Err(join_error) => {
                    // A panicked connect task loses its descriptor; log and move on.
                    tracing::error!(error = %join_error, "tool server connect task panicked");
                }
            }
        }

        let pool = ClientPool {
            inner: Arc::new(PoolInner {
                servers,
                closed: AtomicBool::new(false),
            }),
        };

        let teardown_pool = pool.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            teardown_pool.close_all().await;
        });

        (pool, failures)
    }

    /// Build a pool from already-connected handles. Used when the caller
    /// manages connections itself and by in-memory test servers.
    pub fn from_servers(servers: Vec<Arc<dyn ToolServer>>) -> ClientPool {
        ClientPool {
            inner: Arc::new(PoolInner {
                servers,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Live servers, in descriptor order.
    pub fn servers(&self) -> &[Arc<dyn ToolServer>] {
        &self.inner.servers
    }

    pub fn is_empty(&self) -> bool {
        self.inner.servers.is_empty()
    }

    /// Close every handle exactly once. The normal-completion path and the
    /// cancellation path both call this; the atomic swap lets the first
    /// caller through and turns the second into a no-op.
    pub async fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for server in &self.inner.servers {
            server.close().await;
        }
        tracing::debug!(count = self.inner.servers.len(), "tool server pool closed");
    }
}

async fn connect_one(
    descriptor: &ServerDescriptor,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<McpClient, McpError> {
    let recipe = transport::resolve(descriptor)?;
    tokio::select! {
        _ = cancel.cancelled() => Err(McpError::Cancelled),
        connected = tokio::time::timeout(timeout, McpClient::connect(recipe)) => {
            match connected {
                Ok(Ok(client)) => {
                    // The turn may have been cancelled while the handshake
                    // ran; never hand back a live handle nobody will close.
                    if cancel.is_cancelled() {
                        client.close().await;
                        Err(McpError::Cancelled)
                    } else {
                        Ok(client)
                    }
                }
                Ok(Err(error)) => Err(error),
                Err(_) => Err(McpError::ConnectTimeout),
            }
        }
    }
}
