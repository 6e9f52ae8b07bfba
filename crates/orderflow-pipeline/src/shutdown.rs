//! Cooperative shutdown for the long-running loops.
//!
//! Every loop holds a [`Shutdown`] and checks it between units of work; the
//! binary keeps the [`ShutdownTrigger`] and fires it on SIGINT or SIGTERM.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

pub fn channel() -> (ShutdownTrigger, Shutdown) {
  let (tx, rx) = watch::channel(false);
  (ShutdownTrigger { tx }, Shutdown { rx })
}

pub struct ShutdownTrigger {
  tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
  pub fn trigger(&self) { self.tx.send_replace(true); }

  /// Wait for SIGINT or SIGTERM, then trigger.
  pub async fn trigger_on_signal(self) {
    match wait_for_signal().await {
      Ok(()) => info!("shutdown signal received"),
      Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signals"),
    }
    self.trigger();
  }
}

/// Read side of the shutdown channel. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
  rx: watch::Receiver<bool>,
}

impl Shutdown {
  pub fn is_triggered(&self) -> bool { *self.rx.borrow() }

  /// Resolve once shutdown is triggered. A dropped trigger counts as
  /// triggered, since nothing can fire it any more.
  pub async fn wait(&self) {
    let mut rx = self.rx.clone();
    let _ = rx.wait_for(|triggered| *triggered).await;
  }

  /// Sleep for `duration` unless shutdown comes first. Returns `false` when
  /// interrupted.
  pub async fn sleep(&self, duration: Duration) -> bool {
    tokio::select! {
      _ = tokio::time::sleep(duration) => !self.is_triggered(),
      _ = self.wait() => false,
    }
  }
}

async fn wait_for_signal() -> std::io::Result<()> {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
      result = tokio::signal::ctrl_c() => result,
      _ = terminate.recv() => Ok(()),
    }
  }
  #[cfg(not(unix))]
  {
    tokio::signal::ctrl_c().await
  }
}
