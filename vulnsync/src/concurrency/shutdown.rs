//! Watch-channel based shutdown signaling.
//!
//! A single shutdown signal reaches every subscriber simultaneously. The
//! pipeline checks it between source passes and the scanner checks it between
//! pages, so abandoning a run never corrupts state: a watermark that did not
//! advance simply makes the next run reprocess the same window.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<bool>;

impl ShutdownTx {
    /// Signals shutdown to all subscribers.
    ///
    /// Fails only when every receiver has been dropped, which means nothing is
    /// left to shut down.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<bool>> {
        self.0.send(true)
    }

    /// Creates a new receiver observing the current shutdown state.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a shutdown channel in the "running" state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), rx)
}

/// Returns whether shutdown has been requested, without waiting.
pub fn shutdown_requested(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}
