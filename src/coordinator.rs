//! C8: Worker-coordination Channel. Rewrite of the Design Notes' "module-level
//! global state for primary-only workers" into a `Coordinator` object whose
//! lifecycle is tied to process start/stop and whose `is_primary` is computed
//! once the lease is acquired, not read off a shared global. Every
//! primary-only actor (`SchedulerHandle`, `SyncWorkerHandle`) takes a
//! `Coordinator` and checks it instead of branching on ambient state.
//!
//! Grounded on the teacher's handle-over-channel shape
//! (`actors::queue_manager`), with the channel here wrapping Redis pub/sub
//! (C2's primitive, per §4.8) instead of a database connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metrics_update;

/// Payload carried on the coordination channel, per §4.8: "operations that
/// must execute on the primary are sent on a pub/sub channel with payload
/// `{operation, ...args}`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub operation: String,
    pub auction_id: Option<String>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait PrimaryLease: Send + Sync {
    /// Attempts to (re-)acquire the primary lease for `ttl`. Returns whether
    /// this process holds it after the call.
    async fn try_acquire(&self, holder_id: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, holder_id: &str) -> Result<()>;
}

#[async_trait]
pub trait CoordinationChannel: Send + Sync {
    async fn publish(&self, message: CoordinationMessage) -> Result<()>;

    /// Subscribes and returns a receiver of every message published after
    /// the call. Malformed payloads are logged and dropped (§4.8: "malformed
    /// or duplicate messages are logged and ignored"), never surfaced to the
    /// caller as an error.
    async fn subscribe(&self) -> Result<mpsc::Receiver<CoordinationMessage>>;
}

/// Always-primary lease, used for single-worker deployments and tests.
pub struct AlwaysPrimaryLease;

#[async_trait]
impl PrimaryLease for AlwaysPrimaryLease {
    async fn try_acquire(&self, _holder_id: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _holder_id: &str) -> Result<()> {
        Ok(())
    }
}

/// In-process coordination channel backed by a `tokio::sync::broadcast`
/// channel. Fine for single-worker deployments and tests; production
/// multi-worker deployments use a Redis pub/sub-backed implementation
/// against C2 (not shipped here since it is a thin `redis::aio::PubSub`
/// wrapper with the identical trait surface).
pub struct LocalCoordinationChannel {
    sender: tokio::sync::broadcast::Sender<CoordinationMessage>,
}

impl Default for LocalCoordinationChannel {
    fn default() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(256);
        LocalCoordinationChannel { sender }
    }
}

impl LocalCoordinationChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationChannel for LocalCoordinationChannel {
    async fn publish(&self, message: CoordinationMessage) -> Result<()> {
        // No subscribers is not an error: §4.8 primary-only operations are
        // fire-and-forget from the sender's perspective.
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<CoordinationMessage>> {
        let mut broadcast_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("coordination channel subscriber lagged by {n} messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// The sole owner of primary-only state (round-scheduler timers, the sync
/// worker, and the bot simulator's trigger consumer), per §4.8 and the
/// Design Notes' "top-level `Coordinator` object" rewrite.
pub struct Coordinator {
    holder_id: String,
    lease: Arc<dyn PrimaryLease>,
    pub channel: Arc<dyn CoordinationChannel>,
    is_primary: AtomicBool,
}

impl Coordinator {
    pub fn new(holder_id: String, lease: Arc<dyn PrimaryLease>, channel: Arc<dyn CoordinationChannel>) -> Self {
        Coordinator {
            holder_id,
            lease,
            channel,
            is_primary: AtomicBool::new(false),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::Acquire)
    }

    /// Spawns the lease-renewal loop. Call once at process start; holding
    /// the lease is re-evaluated every `ttl / 3` so a worker that fails to
    /// renew lets another acquire it well before the lease actually expires.
    pub fn spawn_lease_loop(self: &Arc<Self>, ttl: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            let renew_every = ttl / 3;
            loop {
                match this.lease.try_acquire(&this.holder_id, ttl).await {
                    Ok(acquired) => {
                        let was_primary = this.is_primary.swap(acquired, Ordering::AcqRel);
                        metrics_update!(set PRIMARY_LEASE_HELD, if acquired { 1.0 } else { 0.0 });
                        if acquired && !was_primary {
                            info!("worker {} acquired the primary lease", this.holder_id);
                        } else if !acquired && was_primary {
                            warn!("worker {} lost the primary lease", this.holder_id);
                        }
                    }
                    Err(err) => {
                        error!("primary lease renewal failed: {err}");
                        this.is_primary.store(false, Ordering::Release);
                        metrics_update!(set PRIMARY_LEASE_HELD, 0.0);
                    }
                }
                tokio::time::sleep(renew_every).await;
            }
        });
    }

    /// Graceful shutdown: release the lease so another worker can pick it up
    /// immediately rather than waiting out the TTL (§10.7's supplemented
    /// graceful-shutdown path).
    pub async fn release(&self) {
        if self.is_primary.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.lease.release(&self.holder_id).await {
                warn!("failed to release primary lease cleanly: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_primary_lease_is_always_acquired() {
        let lease = AlwaysPrimaryLease;
        assert!(lease.try_acquire("w1", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn local_channel_delivers_published_messages() {
        let channel = LocalCoordinationChannel::new();
        let mut rx = channel.subscribe().await.unwrap();
        channel
            .publish(CoordinationMessage {
                operation: "start-bots".to_string(),
                auction_id: Some("a1".to_string()),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.operation, "start-bots");
    }

    #[tokio::test]
    async fn coordinator_becomes_primary_after_lease_loop_tick() {
        let coordinator = Arc::new(Coordinator::new(
            "w1".to_string(),
            Arc::new(AlwaysPrimaryLease),
            Arc::new(LocalCoordinationChannel::new()),
        ));
        coordinator.spawn_lease_loop(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.is_primary());
    }
}
