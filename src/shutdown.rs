// ===============================
// src/shutdown.rs
// ===============================
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// Cooperative shutdown token shared by every loop in the process.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true only for the call that actually flipped the flag.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|v| {
            if *v {
                false
            } else {
                *v = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool { *self.tx.borrow() }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// Sleeps for `d`, waking early on shutdown. Returns true when shutting down.
    pub async fn sleep(&self, d: Duration) -> bool {
        tokio::select! {
            _ = sleep(d) => self.is_triggered(),
            _ = self.wait() => true,
        }
    }
}
