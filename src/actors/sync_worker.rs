//! C4: Sync Worker. Drains each active auction's dirty-user set from the hot
//! cache into the ledger on a fixed cadence (§4.4). Structured the same way
//! as `Scheduler`: a plain struct over shared store handles, primary-gated,
//! with its background loop spawned by a `Ctx::setup_and_run`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::AtomicAuctionStore;
use crate::errors::LedgerError;
use crate::ledger::LedgerStore;
use crate::metrics_update;
use crate::model::{Auction, Bid, BidStatus};
use crate::register::Register;

pub struct SyncWorker {
    cache: Arc<dyn AtomicAuctionStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl SyncWorker {
    pub fn new(cache: Arc<dyn AtomicAuctionStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        SyncWorker { cache, ledger }
    }

    pub async fn drain_all(&self) -> Result<()> {
        let auctions = self.ledger.list_active_auctions().await?;
        for auction in auctions {
            if let Err(err) = self.drain_one(&auction).await {
                error!("sync drain failed for auction {}: {err}", auction.id);
            }
        }
        Ok(())
    }

    /// Reads `dirty-users` for one auction and pushes each user's hot-cache
    /// bid forward into the ledger via `freeze`, computing the delta against
    /// the ledger's current bid amount (§4.4). Clears exactly the users that
    /// synced cleanly.
    async fn drain_one(&self, auction: &Auction) -> Result<()> {
        let dirty = self.cache.dirty_users(&auction.id).await?;
        if dirty.is_empty() {
            return Ok(());
        }
        metrics_update!(set SYNC_DIRTY_USERS_PENDING, &[auction.id.as_str()], dirty.len() as f64);

        let mut synced = Vec::with_capacity(dirty.len());
        for user_id in &dirty {
            match self.sync_user(auction, user_id).await {
                Ok(()) => synced.push(user_id.clone()),
                Err(LedgerError::Conflict(conflict)) => {
                    warn!("sync conflict for user {user_id} in auction {}: {conflict}", auction.id);
                }
                Err(err) => {
                    error!("sync failed for user {user_id} in auction {}: {err}", auction.id);
                }
            }
        }

        if !synced.is_empty() {
            self.cache.clear_dirty(&auction.id, &synced).await?;
        }
        metrics_update!(set SYNC_DRAIN_LAG_SECONDS, &[auction.id.as_str()], 0.0);
        debug!("auction {} synced {}/{} dirty users", auction.id, synced.len(), dirty.len());
        Ok(())
    }

    async fn sync_user(&self, auction: &Auction, user_id: &str) -> Result<(), LedgerError> {
        let Some(cache_bid) = self.cache.get_bid(&auction.id, &user_id.to_string()).await.map_err(|_| {
            LedgerError::NotFound(user_id.to_string())
        })? else {
            return Ok(());
        };

        let existing = self.ledger.get_active_bid(&auction.id, &user_id.to_string()).await?;
        let (bid_id, previous_amount) = match &existing {
            Some(bid) => (bid.id.clone(), bid.amount),
            None => (Uuid::new_v4().to_string(), 0),
        };

        let delta = cache_bid.amount - previous_amount;
        if delta > 0 {
            self.ledger
                .freeze(&user_id.to_string(), delta, &auction.id, &bid_id)
                .await?;
        }

        let bid = Bid {
            id: bid_id,
            auction_id: auction.id.clone(),
            user_id: user_id.to_string(),
            amount: cache_bid.amount,
            status: BidStatus::Active,
            won_round: None,
            item_number: None,
            created_at: cache_bid.created_at,
            updated_at: cache_bid.created_at,
        };
        self.ledger.upsert_active_bid(&bid).await?;
        Ok(())
    }
}

pub struct SyncWorkerCtx;

impl SyncWorkerCtx {
    pub async fn setup_and_run(register: &Register) -> Result<SyncWorkerHandle> {
        let worker = Arc::new(SyncWorker::new(register.cache.clone(), register.ledger.clone()));
        let coordinator = register.coordinator.clone();
        let interval = Duration::from_millis(register.config.get_scheduler_config().sync_drain_interval_ms);

        {
            let worker = worker.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                loop {
                    if coordinator.is_primary() {
                        if let Err(err) = worker.drain_all().await {
                            error!("sync worker drain failed: {err}");
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            });
        }

        info!("sync worker spawned");
        Ok(SyncWorkerHandle { worker })
    }
}

#[derive(Clone)]
pub struct SyncWorkerHandle {
    worker: Arc<SyncWorker>,
}

impl SyncWorkerHandle {
    /// Drains a single auction immediately, used by the warm-up path when a
    /// caller needs the ledger caught up before reading it back out.
    pub async fn drain_now(&self, auction: &Auction) -> Result<()> {
        self.worker.drain_one(auction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store::MemoryAuctionStore;
    use crate::cache::{BalanceProjection, CacheMeta};
    use crate::ledger::memory_store::MemoryLedgerStore;
    use crate::model::{AuctionStatus, RoundSpec};

    fn seed_auction() -> Auction {
        Auction {
            id: "a1".to_string(),
            title: "t".to_string(),
            owner: "owner".to_string(),
            total_items: 1,
            round_specs: vec![RoundSpec { items_count: 1, duration_minutes: 5 }],
            min_bid_amount: 100,
            min_bid_increment: 10,
            anti_sniping_window_ms: 60_000,
            anti_sniping_extension_ms: 60_000,
            max_extensions: 5,
            bots_enabled: false,
            bot_count: 0,
            status: AuctionStatus::Active,
            current_round: 1,
            rounds: vec![crate::model::RoundState {
                start_time: Some(0),
                end_time: Some(300_000),
                items_count: 1,
                extensions_count: 0,
                completed: false,
                winner_bid_ids: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn drain_freezes_the_cache_amount_against_the_ledger() {
        let cache = Arc::new(MemoryAuctionStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let worker = SyncWorker::new(cache.clone(), ledger.clone());
        let auction = seed_auction();

        ledger.ensure_user(&"u1".to_string(), "u1").await.unwrap();
        ledger.deposit(&"u1".to_string(), 1000).await.unwrap();

        cache
            .warm_up(
                &auction.id,
                CacheMeta {
                    min_bid_amount: 100,
                    min_bid_increment: 10,
                    status: AuctionStatus::Active,
                    current_round: 1,
                    round_end_time: 300_000,
                    items_in_round: 1,
                    anti_sniping_window_ms: 60_000,
                    anti_sniping_extension_ms: 60_000,
                    max_extensions: 5,
                    extensions_count: 0,
                    warm_version: 1,
                },
                vec![("u1".to_string(), BalanceProjection { available: 1000, frozen: 0 })],
                vec![],
            )
            .await
            .unwrap();

        cache.place_bid_fast(&auction.id, &"u1".to_string(), 500, 0).await.unwrap();

        worker.drain_one(&auction).await.unwrap();

        let user = ledger.get_user(&"u1".to_string()).await.unwrap().unwrap();
        assert_eq!(user.balance, 500);
        assert_eq!(user.frozen_balance, 500);

        let dirty = cache.dirty_users(&auction.id).await.unwrap();
        assert!(dirty.is_empty(), "synced user should be cleared from the dirty set");
    }
}
