//! Shutdown plumbing shared by every long-lived loop.
//!
//! One watch channel fans the stop signal out; loops call
//! [`wait_or_shutdown`] instead of sleeping so cancellation is honored
//! within one sleep quantum.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Create the shutdown channel. Flip it with [`trigger`].
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Flip the shutdown flag; receivers wake at their next suspension point.
pub fn trigger(sender: &watch::Sender<bool>) {
    let _ = sender.send(true);
}

/// Resolve when Ctrl-C (or SIGTERM delivery as Ctrl-C) arrives, then flip
/// the shutdown flag.
pub async fn on_interrupt(sender: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, shutting down");
    }
    trigger(&sender);
}

/// Sleep for `duration` unless shutdown flips first; returns `true` on
/// shutdown.
pub async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        result = shutdown.wait_for(|stop| *stop) => return result.is_ok(),
    }
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_on_signal_before_timer() {
        let (tx, mut rx) = shutdown_channel();
        let waiter =
            tokio::spawn(async move { wait_or_shutdown(&mut rx, Duration::from_secs(600)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger(&tx);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn elapses_quietly_without_signal() {
        let (_tx, mut rx) = shutdown_channel();
        assert!(!wait_or_shutdown(&mut rx, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn already_stopped_returns_immediately() {
        let (tx, mut rx) = shutdown_channel();
        trigger(&tx);
        assert!(wait_or_shutdown(&mut rx, Duration::from_secs(600)).await);
    }
}
