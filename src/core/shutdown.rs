//! Cooperative shutdown shared by the ingress, scanner and egress loops.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Owns the shutdown flag. Loops hold a [`ShutdownSignal`] each.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    timeout: Duration,
}

/// Receiving side of the shutdown flag. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered, or the coordinator is gone.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, timeout }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested");
        }
    }

    /// Waits for SIGINT or SIGTERM.
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }
    }

    /// Triggers shutdown when `until` resolves.
    pub async fn trigger_on<F: Future<Output = ()>>(&self, until: F) {
        until.await;
        self.trigger();
    }

    /// Joins `tasks`, giving all of them together at most the configured
    /// timeout. Returns `false` if any task had to be abandoned.
    pub async fn join_all(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut clean = true;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "task failed");
                    clean = false;
                }
                Err(_) => {
                    warn!(task = name, timeout = ?self.timeout, "task did not stop in time, aborting");
                    handle.abort();
                    clean = false;
                }
            }
        }
        clean
    }
}
