//! # Server
//!
//! Listens on the local command socket and drives a connection task per
//! client. The accept loop only ever accepts and spawns; every disk wait
//! lives in a per-connection task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info};

pub mod conn;
pub mod shutdown;

use crate::daemon::Daemon;
use crate::requests::spawn_request_poller;
use conn::Connection;
use shutdown::Shutdown;

#[derive(Debug)]
pub struct Server {
    daemon: Arc<Daemon>,
}

impl Server {
    pub fn new(daemon: Arc<Daemon>) -> Server {
        Server { daemon }
    }

    /// Serve until the shutdown future resolves (signal or SHUTDOWN
    /// command), then drain connections and tear the daemon down.
    pub async fn listen<F>(self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let poller = spawn_request_poller(Arc::clone(&self.daemon));

        tokio::select! {
            res = self.accept_loop(&listener, &notify_shutdown, &shutdown_complete_tx) => {
                if let Err(err) = res {
                    error!(?err, "error occurred in the accept loop");
                }
            }
            res = shutdown => {
                info!("caught shutdown");
                if let Err(err) = res {
                    error!(?err);
                }
            }
        }

        // Dropping `notify_shutdown` wakes every connection's Shutdown;
        // dropping the last `shutdown_complete_tx` closes the drain channel.
        drop(notify_shutdown);
        drop(shutdown_complete_tx);
        if time::timeout(Duration::from_secs(3), shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            error!("connections did not finish within 3 seconds, continuing shutdown");
        } else {
            debug!("all connections finished cleanly");
        }

        self.daemon.shutdown().await;
        let _ = poller.await;
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: &UnixListener,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await.context("accept on command socket")?;
            let connection = Connection::new(stream, Arc::clone(&self.daemon));
            let shutdown = Shutdown::new(notify_shutdown.subscribe());
            let _shutdown_complete = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                connection.run(shutdown).await;
                drop(_shutdown_complete);
            });
        }
    }
}
