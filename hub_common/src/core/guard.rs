//! Per-subscriber notification deadline: a bounded, best-effort send that
//! skips a subscriber rather than blocking or removing it when it cannot
//! accept a value within 200 ms.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

/// The deadline a subscriber notification must complete within.
pub const SUBSCRIBER_DEADLINE: Duration = Duration::from_millis(200);

/// Wraps a bounded `mpsc::Sender<T>` with the deadline-gated send used by
/// PortManager and Dispatcher fan-out.
///
/// A slow subscriber is skipped for the current update, not disconnected:
/// skipping is a per-call decision, never a standing removal.
pub struct SubscriberGuard<T> {
    sender: mpsc::Sender<T>,
}

impl<T> Clone for SubscriberGuard<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> SubscriberGuard<T> {
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { sender }
    }

    /// Attempt to deliver `value` within [`SUBSCRIBER_DEADLINE`].
    ///
    /// Returns `true` if delivered, `false` if the deadline elapsed or the
    /// subscriber's channel is closed.
    pub async fn try_notify(&self, value: T) -> bool {
        matches!(timeout(SUBSCRIBER_DEADLINE, self.sender.send(value)).await, Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_when_receiver_ready() {
        let (tx, mut rx) = mpsc::channel(1);
        let guard = SubscriberGuard::new(tx);
        assert!(guard.try_notify(42).await);
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn skips_when_channel_closed() {
        let (tx, rx) = mpsc::channel::<i32>(1);
        drop(rx);
        let guard = SubscriberGuard::new(tx);
        assert!(!guard.try_notify(1).await);
    }

    #[tokio::test]
    async fn skips_full_channel_past_deadline() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(0).unwrap(); // fill the one slot, receiver never drains
        let guard = SubscriberGuard::new(tx);
        assert!(!guard.try_notify(1).await);
    }
}
