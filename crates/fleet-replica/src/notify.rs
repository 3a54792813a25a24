//! # notify
//!
//! why: membership changes must wake the overlay without lost wakeups
//! relations: broadcast by membership and transfer; awaited by the overlay loop
//! what: ClusterChange
//!
//! A generation counter behind a watch channel: every broadcast bumps the
//! generation, every waiter wakes on the next bump or on its forced tick,
//! whichever comes first. A bump that happens while nobody is waiting is
//! still observed by the next wait, so wakeups cannot be lost.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ClusterChange {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ClusterChange {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterChange {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// wake every waiter
    pub fn broadcast(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Waiter {
        Waiter { rx: self.tx.subscribe() }
    }
}

#[derive(Debug)]
pub struct Waiter {
    rx: watch::Receiver<u64>,
}

impl Waiter {
    /// block until the next broadcast or until `tick` elapses
    pub async fn wait(&mut self, tick: Duration) {
        tokio::select! {
            changed = self.rx.changed() => {
                if changed.is_err() {
                    // every sender is gone; fall back to the tick alone
                    tokio::time::sleep(tick).await;
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }
}
