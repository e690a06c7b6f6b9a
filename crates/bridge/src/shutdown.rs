//! Shared shutdown signal
//!
//! One `watch` channel per service instance. Every long-lived task holds a
//! receiver and observes the signal cooperatively.

use tokio::sync::watch;

/// Sending half, owned by the service lifecycle
pub type ShutdownSender = watch::Sender<bool>;

/// Receiving half, cloned into every task
pub type ShutdownReceiver = watch::Receiver<bool>;

/// Create a new, unsignalled shutdown channel
#[must_use]
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

/// Resolve once shutdown has been signalled.
///
/// A dropped sender counts as shutdown.
pub async fn signalled(rx: &mut ShutdownReceiver) {
    let _ = rx.wait_for(|closing| *closing).await;
}

/// Check the signal without waiting
#[must_use]
pub fn is_signalled(rx: &ShutdownReceiver) -> bool {
    *rx.borrow()
}
