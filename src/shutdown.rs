//! Process-wide shutdown signal
//!
//! A `watch` channel carrying `true` once shutdown starts. The broker loop and
//! every delivery hold a receiver and use [`interruptible_sleep`] for their
//! waits, so no timer outlives `stop()`.

use std::time::Duration;
use tokio::sync::watch;

pub type ShutdownReceiver = watch::Receiver<bool>;

/// Sending half of the shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownReceiver {
        self.tx.subscribe()
    }

    /// Flip the signal; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns true if the full delay elapsed, false if shutdown interrupted it.
/// A dropped sender is not a shutdown; the sleep then runs to completion.
pub async fn interruptible_sleep(shutdown_rx: &mut ShutdownReceiver, delay: Duration) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => match changed {
                Ok(()) if *shutdown_rx.borrow_and_update() => return false,
                Ok(()) => continue,
                Err(_) => {
                    (&mut sleep).await;
                    return true;
                }
            }
        }
    }
}

/// Resolve once shutdown is signalled or the trigger is dropped
pub async fn wait_for_shutdown(shutdown_rx: &mut ShutdownReceiver) {
    if *shutdown_rx.borrow_and_update() {
        return;
    }
    while shutdown_rx.changed().await.is_ok() {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });

        trigger.trigger();
        waiter.await.unwrap();

        let dropped = ShutdownTrigger::new();
        let mut rx = dropped.subscribe();
        drop(dropped);
        wait_for_shutdown(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();

        let started = tokio::time::Instant::now();
        assert!(interruptible_sleep(&mut rx, Duration::from_secs(5)).await);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();

        let sleeper = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let completed = interruptible_sleep(&mut rx, Duration::from_secs(30)).await;
            (completed, started.elapsed())
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        let (completed, elapsed) = sleeper.await.unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_already_triggered_returns_immediately() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let mut rx = trigger.subscribe();

        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(3600)).await);
        assert!(trigger.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_does_not_cut_sleep_short() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();
        drop(trigger);

        let started = tokio::time::Instant::now();
        assert!(interruptible_sleep(&mut rx, Duration::from_secs(2)).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
