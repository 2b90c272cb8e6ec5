//! SSH connection pool for remote workers.
//!
//! One [`SshConnection`] per remote worker, keyed by worker id. Each
//! connection keeps itself alive with a periodic probe and reconnects with
//! exponential backoff after a transport drop. Interactive shell channels,
//! one-shot execs and port forwards all multiplex over the same underlying
//! SSH session.

mod connection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::{HubError, Worker, WorkerStatus};
use crate::store::SqliteStore;

pub use connection::{RemoteShell, SshConnection};

/// Default deadline for SSH dial and one-shot exec calls.
pub const SSH_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool of SSH connections, one per remote worker.
pub struct TunnelManager {
    connections: Mutex<HashMap<Uuid, Arc<SshConnection>>>,
    store: Arc<SqliteStore>,
}

impl TunnelManager {
    #[must_use]
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Dial a remote worker and add it to the pool. Updates the worker's
    /// status row: `connected` on success, `error` on authentication
    /// failure, `disconnected` on transport failure.
    ///
    /// # Errors
    ///
    /// Returns the underlying failure; the status row is updated either
    /// way.
    pub async fn connect(&self, worker: &Worker) -> Result<(), HubError> {
        let connection = {
            let mut connections = self.connections.lock().await;
            if let Some(existing) = connections.get(&worker.id) {
                Arc::clone(existing)
            } else {
                let connection = Arc::new(SshConnection::from_worker(
                    worker,
                    Arc::clone(&self.store),
                )?);
                connections.insert(worker.id, Arc::clone(&connection));
                connection
            }
        };

        match connection.establish().await {
            Ok(()) => {
                self.store
                    .set_worker_status(worker.id, WorkerStatus::Connected)
                    .await
                    .map_err(HubError::Internal)?;
                connection.spawn_keepalive();
                Ok(())
            }
            Err(err) => {
                let status = match &err {
                    HubError::Forbidden(_) | HubError::BadInput(_) => WorkerStatus::Error,
                    _ => WorkerStatus::Disconnected,
                };
                let _ = self.store.set_worker_status(worker.id, status).await;
                Err(err)
            }
        }
    }

    /// Open an interactive PTY shell channel on a connected worker.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ConnectionLost`] while the tunnel is down or
    /// reconnecting.
    pub async fn shell(
        &self,
        worker_id: Uuid,
        cols: u16,
        rows: u16,
    ) -> Result<RemoteShell, HubError> {
        let connection = self.get(worker_id).await?;
        connection.open_shell(cols, rows).await
    }

    /// Run a one-shot command on a connected worker and collect stdout.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ConnectionLost`] while the tunnel is down and
    /// [`HubError::Timeout`] when the default deadline expires.
    pub async fn exec(&self, worker_id: Uuid, command: &str) -> Result<String, HubError> {
        let connection = self.get(worker_id).await?;
        connection.exec(command, SSH_OP_TIMEOUT).await
    }

    /// Forward a remote TCP port: allocates a local port and proxies every
    /// accepted connection through the SSH session. Returns the local port.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ConnectionLost`] while the tunnel is down.
    pub async fn forward_port(&self, worker_id: Uuid, remote_port: u16) -> Result<u16, HubError> {
        let connection = self.get(worker_id).await?;
        connection.forward_port(remote_port).await
    }

    /// Close one worker's connection and stop its reconnect attempts.
    pub async fn disconnect(&self, worker_id: Uuid) {
        let connection = self.connections.lock().await.remove(&worker_id);
        if let Some(connection) = connection {
            connection.close().await;
            let _ = self
                .store
                .set_worker_status(worker_id, WorkerStatus::Disconnected)
                .await;
        }
    }

    /// Tear down every connection; no further reconnects occur.
    pub async fn destroy_all(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.lock().await;
            connections.drain().collect()
        };
        for (worker_id, connection) in drained {
            connection.close().await;
            let _ = self
                .store
                .set_worker_status(worker_id, WorkerStatus::Disconnected)
                .await;
        }
    }

    async fn get(&self, worker_id: Uuid) -> Result<Arc<SshConnection>, HubError> {
        self.connections
            .lock()
            .await
            .get(&worker_id)
            .cloned()
            .ok_or(HubError::ConnectionLost { worker_id })
    }
}
