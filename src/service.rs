//! The §6 façade: the only surface the outside controllers call into.
//! Shaped after the teacher's actor handles (a plain struct of cloneable
//! `Arc`s, no mailbox of its own) since, like `Scheduler`, nothing here owns
//! private state worth serializing through a channel — every method either
//! delegates straight to C1/C2/C3 or composes a couple of those calls.

use log::warn;
use uuid::Uuid;

use crate::cache::{AtomicAuctionStore, PlaceBidOutcome};
use crate::actors::scheduler::SchedulerHandle;
use crate::errors::{BidError, ServiceError};
use crate::ledger::{IntegrityReport, LedgerStore};
use crate::model::{AuctionId, AuctionRef, AuctionStatus, AuctionSummary, Bid, BidStatus, UserId};
use crate::retry_with_backoff;

use std::sync::Arc;

/// One leaderboard row: a live entry's amount/creation time, resolved from
/// the hot cache rather than carried as an opaque score (§4.2's score
/// encoding is an internal ordering detail, not part of this façade).
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub amount: i64,
    pub created_at: i64,
}

/// A winner of an already-completed round, derived from C3 (§6): the hot
/// cache only knows about the *current* round.
#[derive(Debug, Clone)]
pub struct PastWinner {
    pub round_number: u32,
    pub user_id: UserId,
    pub amount: i64,
    pub item_number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LeaderboardView {
    pub entries: Vec<LeaderboardEntry>,
    pub past_winners: Vec<PastWinner>,
}

pub struct BidService {
    cache: Arc<dyn AtomicAuctionStore>,
    ledger: Arc<dyn LedgerStore>,
    scheduler: SchedulerHandle,
}

impl BidService {
    pub fn new(cache: Arc<dyn AtomicAuctionStore>, ledger: Arc<dyn LedgerStore>, scheduler: SchedulerHandle) -> Self {
        BidService { cache, ledger, scheduler }
    }

    /// Slow path (§6): validates against the ledger, freezes via C3, then
    /// warms (if the cache has nothing for this auction) or mirrors (if it
    /// does) the same bid into C2. Retries the ledger freeze a bounded
    /// number of times on a version conflict, same as the scheduler's
    /// round-completion primitives.
    pub async fn place_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, ServiceError> {
        if amount < 1 {
            return Err(BidError::MinBid.into());
        }

        let auction = self
            .ledger
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(auction_id.clone()))?;

        if auction.status != AuctionStatus::Active {
            return Err(BidError::NotActive.into());
        }
        let round_state = auction.current_round_state().ok_or(BidError::NotActive)?;
        let round_end_time = round_state.end_time.ok_or(BidError::NotActive)?;
        if now_ms > round_end_time {
            return Err(BidError::RoundEnded.into());
        }
        let items_in_round = round_state.items_count;

        let existing = self.ledger.get_active_bid(auction_id, user_id).await?;
        let previous_amount = existing.as_ref().map(|b| b.amount).unwrap_or(0);

        if let Some(bid) = &existing {
            if amount < bid.amount + auction.min_bid_increment {
                return Err(BidError::BidTooLow.into());
            }
        } else if amount < auction.min_bid_amount {
            return Err(BidError::MinBid.into());
        }

        let delta = amount - previous_amount;
        let user = self
            .ledger
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(user_id.clone()))?;
        if user.balance < delta {
            return Err(BidError::InsufficientBalance.into());
        }

        // Preserve `createdAt` on an increase (§9's first Decision): the bid
        // id and creation time carry over, only `amount`/`updatedAt` move.
        let bid_id = existing.as_ref().map(|b| b.id.clone()).unwrap_or_else(|| Uuid::new_v4().to_string());
        let created_at = existing.as_ref().map(|b| b.created_at).unwrap_or(now_ms);

        retry_with_backoff!(self.ledger.freeze(user_id, delta, auction_id, &bid_id).await, 3, 20)?;

        let bid = Bid {
            id: bid_id,
            auction_id: auction_id.clone(),
            user_id: user_id.clone(),
            amount,
            status: BidStatus::Active,
            won_round: None,
            item_number: None,
            created_at,
            updated_at: now_ms,
        };
        self.ledger.upsert_active_bid(&bid).await?;

        match self.cache.get_meta(auction_id).await? {
            None => {
                if let Err(err) = self.scheduler.warm_up(&auction, now_ms).await {
                    warn!("warm-up after slow-path bid failed for auction {auction_id}: {err}");
                }
            }
            Some(_) => {
                if let Err(err) = self.cache.place_bid_fast(auction_id, user_id, amount, now_ms).await {
                    warn!("mirroring slow-path bid into hot cache failed for auction {auction_id}: {err}");
                }
            }
        }

        Ok(PlaceBidOutcome {
            new_amount: amount,
            previous_amount,
            frozen_delta: delta,
            is_new_bid: existing.is_none(),
            round_end_time,
            anti_sniping_window_ms: auction.anti_sniping_window_ms,
            anti_sniping_extension_ms: auction.anti_sniping_extension_ms,
            max_extensions: auction.max_extensions,
            items_in_round,
            current_round: auction.current_round,
        })
    }

    /// Hot path (§6, §4.1): delegates straight to C1, then kicks the
    /// anti-sniping check exactly like the socket layer's bid handler does
    /// (`consider_anti_sniping` runs regardless of worker primary status,
    /// §9's third open question).
    pub async fn place_bid_fast(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, ServiceError> {
        let outcome = self.cache.place_bid_fast(auction_id, user_id, amount, now_ms).await?;
        if let Err(err) = self.scheduler.consider_anti_sniping(auction_id, now_ms).await {
            warn!("anti-sniping check failed after fast-path bid on auction {auction_id}: {err}");
        }
        Ok(outcome)
    }

    /// Top-`limit` entries from C2 starting at `offset`, plus the full
    /// winner list of every completed round, resolved from C3.
    pub async fn get_leaderboard(
        &self,
        auction_id: &AuctionId,
        limit: usize,
        offset: usize,
    ) -> Result<LeaderboardView, ServiceError> {
        let ranked = self.cache.leaderboard_range(auction_id, offset, limit).await?;
        let mut entries = Vec::with_capacity(ranked.len());
        for (user_id, _score) in ranked {
            if let Some(bid) = self.cache.get_bid(auction_id, &user_id).await? {
                entries.push(LeaderboardEntry {
                    user_id,
                    amount: bid.amount,
                    created_at: bid.created_at,
                });
            }
        }

        // Existence check only; the leaderboard itself comes from C2 above.
        self.ledger
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(auction_id.clone()))?;
        let bids = self.ledger.list_bids_by_auction(auction_id).await?;
        let mut past_winners: Vec<PastWinner> = bids
            .into_iter()
            .filter(|b| b.status == BidStatus::Won)
            .map(|b| PastWinner {
                round_number: b.won_round.unwrap_or(0),
                user_id: b.user_id,
                amount: b.amount,
                item_number: b.item_number,
            })
            .collect();
        past_winners.sort_by(|a, b| a.round_number.cmp(&b.round_number).then(a.item_number.cmp(&b.item_number)));

        Ok(LeaderboardView { entries, past_winners })
    }

    /// A single user's bids within one auction, newest first.
    pub async fn get_my_bids(&self, auction_id: &AuctionId, user_id: &UserId) -> Result<Vec<Bid>, ServiceError> {
        let bids = self.ledger.list_bids_by_user(user_id).await?;
        Ok(bids.into_iter().filter(|b| b.auction_id == *auction_id).collect())
    }

    /// Every bid a user has ever placed, across every auction, each paired
    /// with an `AuctionRef::Summary` resolved on the spot — the sum-type
    /// rewrite of the source's runtime-dispatch populate (Design Notes).
    pub async fn get_user_bids_across_auctions(&self, user_id: &UserId) -> Result<Vec<(Bid, AuctionRef)>, ServiceError> {
        let bids = self.ledger.list_bids_by_user(user_id).await?;
        let mut out = Vec::with_capacity(bids.len());
        for bid in bids {
            let auction_ref = match self.ledger.get_auction(&bid.auction_id).await? {
                Some(a) => AuctionRef::Summary(AuctionSummary {
                    id: a.id,
                    title: a.title,
                    status: a.status,
                    current_round: a.current_round,
                }),
                None => AuctionRef::Id(bid.auction_id.clone()),
            };
            out.push((bid, auction_ref));
        }
        Ok(out)
    }

    /// `lowestWinningAmount + minBidIncrement`, or `None` iff fewer than
    /// `itemsInRound` active bids currently exist (§6, §8 boundary law).
    pub async fn get_min_winning_bid(&self, auction_id: &AuctionId) -> Result<Option<i64>, ServiceError> {
        let meta = self
            .cache
            .get_meta(auction_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(auction_id.clone()))?;
        let k = meta.items_in_round as usize;
        if k == 0 {
            return Ok(None);
        }

        let top_k = self.cache.leaderboard_range(auction_id, 0, k).await?;
        if top_k.len() < k {
            return Ok(None);
        }
        let Some((lowest_user, _)) = top_k.last() else {
            return Ok(None);
        };
        let Some(bid) = self.cache.get_bid(auction_id, lowest_user).await? else {
            return Ok(None);
        };
        Ok(Some(bid.amount + meta.min_bid_increment))
    }

    /// Scans every user and reports `Σ(balance + frozen)` against expected
    /// deposits minus confirmed wins (§6, §8 invariant 1). Delegates
    /// entirely to C3: the hot cache is not authoritative for this check.
    pub async fn audit_financial_integrity(&self) -> Result<IntegrityReport, ServiceError> {
        Ok(self.ledger.audit_financial_integrity().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store::MemoryAuctionStore;
    use crate::configuration::SchedulerConfig;
    use crate::coordinator::{AlwaysPrimaryLease, Coordinator, LocalCoordinationChannel};
    use crate::events::{EventBus, LocalEventBus};
    use crate::ledger::memory_store::MemoryLedgerStore;
    use crate::model::{Auction, RoundSpec, RoundState, User};

    fn test_service() -> BidService {
        let cache: Arc<dyn AtomicAuctionStore> = Arc::new(MemoryAuctionStore::new());
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let config = SchedulerConfig {
            tick_interval_ms: 100,
            countdown_interval_ms: 1000,
            sync_drain_interval_ms: 1000,
            retry_attempts: 3,
            retry_base_delay_ms: 10,
        };
        let anti_sniping_defaults = crate::configuration::AntiSnipingDefaults {
            window_ms: 60_000,
            extension_ms: 60_000,
            max_extensions: 5,
        };
        let coordinator = Arc::new(Coordinator::new(
            "test-worker".to_string(),
            Arc::new(AlwaysPrimaryLease),
            Arc::new(LocalCoordinationChannel::new()),
        ));
        let scheduler = crate::actors::scheduler::Scheduler::new(
            cache.clone(),
            ledger.clone(),
            event_bus,
            config,
            anti_sniping_defaults,
        );
        let scheduler = SchedulerHandle::new(Arc::new(scheduler), coordinator);
        BidService::new(cache, ledger, scheduler)
    }

    fn active_auction(id: &str) -> Auction {
        Auction {
            id: id.to_string(),
            title: "Widget".to_string(),
            owner: "owner-1".to_string(),
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
            rounds: vec![RoundState {
                start_time: Some(0),
                end_time: Some(300_000),
                items_count: 1,
                extensions_count: 0,
                completed: false,
                winner_bid_ids: Vec::new(),
            }],
        }
    }

    use crate::ledger::LedgerStore as _;

    #[tokio::test]
    async fn slow_path_rejects_a_bid_below_the_minimum() {
        let service = test_service();
        let auction = active_auction("auction-1");
        service.ledger.insert_auction(&auction).await.unwrap();
        service.ledger.ensure_user(&"user-1".to_string(), "A").await.unwrap();
        service.ledger.deposit(&"user-1".to_string(), 1000).await.unwrap();

        let err = service
            .place_bid(&"auction-1".to_string(), &"user-1".to_string(), 50, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Bid(BidError::MinBid)));
    }

    #[tokio::test]
    async fn slow_path_freezes_the_increment_and_preserves_the_total() {
        let service = test_service();
        let auction = active_auction("auction-1");
        service.ledger.insert_auction(&auction).await.unwrap();
        service.ledger.ensure_user(&"user-1".to_string(), "A").await.unwrap();
        service.ledger.deposit(&"user-1".to_string(), 2000).await.unwrap();

        let outcome = service
            .place_bid(&"auction-1".to_string(), &"user-1".to_string(), 500, 1_000)
            .await
            .unwrap();
        assert_eq!(outcome.frozen_delta, 500);
        assert!(outcome.is_new_bid);

        let outcome = service
            .place_bid(&"auction-1".to_string(), &"user-1".to_string(), 800, 2_000)
            .await
            .unwrap();
        assert_eq!(outcome.frozen_delta, 300);
        assert!(!outcome.is_new_bid);

        let user: User = service.ledger.get_user(&"user-1".to_string()).await.unwrap().unwrap();
        assert_eq!(user.total(), 2000);
        assert_eq!(user.frozen_balance, 800);
    }

    #[tokio::test]
    async fn get_min_winning_bid_is_none_until_the_round_is_full() {
        let service = test_service();
        let auction = active_auction("auction-1");
        service.ledger.insert_auction(&auction).await.unwrap();
        service.ledger.ensure_user(&"user-1".to_string(), "A").await.unwrap();
        service.ledger.deposit(&"user-1".to_string(), 1000).await.unwrap();
        service
            .place_bid(&"auction-1".to_string(), &"user-1".to_string(), 500, 1_000)
            .await
            .unwrap();

        assert_eq!(service.get_min_winning_bid(&"auction-1".to_string()).await.unwrap(), Some(510));
    }

    #[tokio::test]
    async fn being_outbid_does_not_unfreeze_the_loser_e3() {
        let service = test_service();
        let auction = active_auction("auction-1");
        service.ledger.insert_auction(&auction).await.unwrap();
        service.ledger.ensure_user(&"user-1".to_string(), "A").await.unwrap();
        service.ledger.deposit(&"user-1".to_string(), 1000).await.unwrap();
        service.ledger.ensure_user(&"user-2".to_string(), "B").await.unwrap();
        service.ledger.deposit(&"user-2".to_string(), 1000).await.unwrap();

        service
            .place_bid(&"auction-1".to_string(), &"user-1".to_string(), 400, 1_000)
            .await
            .unwrap();
        service
            .place_bid(&"auction-1".to_string(), &"user-2".to_string(), 500, 2_000)
            .await
            .unwrap();

        // user-2 now leads the single-item round, but user-1's freeze is
        // untouched: only round completion resolves winners and losers.
        let user1: User = service.ledger.get_user(&"user-1".to_string()).await.unwrap().unwrap();
        assert_eq!(user1.balance, 600);
        assert_eq!(user1.frozen_balance, 400);

        let user2: User = service.ledger.get_user(&"user-2".to_string()).await.unwrap().unwrap();
        assert_eq!(user2.balance, 500);
        assert_eq!(user2.frozen_balance, 500);

        let bid1 = service.ledger.get_active_bid(&"auction-1".to_string(), &"user-1".to_string()).await.unwrap();
        assert!(bid1.is_some(), "outbid bidder keeps an active bid until the round resolves");
    }
}
