use crate::result::Result;
use tokio::sync::watch;
use tracing::info;

/// Process wide stop flag shared by every long running loop.
#[derive(Clone)]
pub struct Shutdown {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    // safe to call more than once
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks until SIGINT or SIGTERM arrives, then flips the stop flag.
pub async fn wait_for_signal(shutdown: Shutdown) -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| format!("failed to install SIGTERM handler: {e}"))?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.map_err(|e| format!("failed to listen for SIGINT: {e}"))?;
            info!("received interrupt, shutting down gracefully");
        }
        _ = term.recv() => {
            info!("received terminate, shutting down gracefully");
        }
    }
    shutdown.trigger();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_idempotent_and_observed() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        rx.changed().await.unwrap();
        assert!(shutdown.is_triggered());
    }
}
