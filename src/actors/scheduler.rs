//! C5: Round Scheduler. Unlike the teacher's actors, nothing here owns
//! private mutable state worth serializing through an mpsc mailbox — the
//! hot cache is already its own actor (§4.2) and the ledger is already
//! transactional, so `Scheduler` is a plain struct of shared handles, kept
//! behind `Arc` and called directly, the same shape `TransactionsLoadingCtx`
//! uses to orchestrate other actors' handles without introducing a mailbox
//! of its own. Primary-only behavior (§4.8) is enforced by gating on
//! `Coordinator::is_primary()` at the start of every primary-only operation,
//! not by only running this code on a distinguished binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::cache::AtomicAuctionStore;
use crate::configuration::{AntiSnipingDefaults, SchedulerConfig};
use crate::coordinator::{Coordinator, CoordinationMessage};
use crate::errors::SchedulerError;
use crate::events::{AuctionEvent, EventBus, WinnerSummary};
use crate::ledger::{LedgerStore, RoundLoser, RoundWinner};
use crate::metrics_update;
use crate::model::{Auction, AuctionId, AuctionStatus, RoundState};
use crate::register::Register;
use crate::retry_with_backoff;

pub struct Scheduler {
    cache: Arc<dyn AtomicAuctionStore>,
    ledger: Arc<dyn LedgerStore>,
    event_bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
    anti_sniping_defaults: AntiSnipingDefaults,
}

impl Scheduler {
    pub fn new(
        cache: Arc<dyn AtomicAuctionStore>,
        ledger: Arc<dyn LedgerStore>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
        anti_sniping_defaults: AntiSnipingDefaults,
    ) -> Self {
        Scheduler {
            cache,
            ledger,
            event_bus,
            config,
            anti_sniping_defaults,
        }
    }

    /// Warms the cache from the ledger's view of an auction (§4.4), used at
    /// auction start, at every round advance, and whenever a caller needs a
    /// user re-seeded mid-round. `now_ms` (not the round's `start_time`)
    /// drives `warm_version`: the round's start time is constant for the
    /// whole round, so gating on it alone would make every re-warm after the
    /// first one in a round a no-op against the idempotency check below,
    /// even though a later bid has since been frozen in the ledger and needs
    /// to land in the cache.
    pub async fn warm_up(&self, auction: &Auction, now_ms: i64) -> Result<(), SchedulerError> {
        let Some(round_state) = auction.current_round_state().cloned() else {
            return Ok(());
        };
        let Some(round_spec) = auction.current_round_spec().cloned() else {
            return Ok(());
        };
        let active_bids = self.ledger.list_active_bids(&auction.id).await?;

        let mut balances = Vec::with_capacity(active_bids.len());
        let mut bids = Vec::with_capacity(active_bids.len());
        for bid in &active_bids {
            let user = self
                .ledger
                .get_user(&bid.user_id)
                .await?
                .ok_or_else(|| crate::errors::LedgerError::NotFound(bid.user_id.clone()))?;
            balances.push((
                bid.user_id.clone(),
                crate::cache::BalanceProjection {
                    available: user.balance,
                    frozen: user.frozen_balance,
                },
            ));
            bids.push((
                bid.user_id.clone(),
                crate::cache::BidProjection {
                    amount: bid.amount,
                    created_at: bid.created_at,
                    version: 0,
                },
            ));
        }

        let meta = crate::cache::CacheMeta {
            min_bid_amount: auction.min_bid_amount,
            min_bid_increment: auction.min_bid_increment,
            status: auction.status,
            current_round: auction.current_round,
            round_end_time: round_state.end_time.unwrap_or(0),
            items_in_round: round_spec.items_count,
            anti_sniping_window_ms: auction.anti_sniping_window_ms,
            anti_sniping_extension_ms: auction.anti_sniping_extension_ms,
            max_extensions: auction.max_extensions,
            extensions_count: round_state.extensions_count,
            warm_version: now_ms.max(round_state.start_time.unwrap_or(0)) as u64,
        };

        self.cache.warm_up(&auction.id, meta, balances, bids).await?;
        Ok(())
    }

    /// Transitions a pending auction to active and warms the cache (§4.5
    /// "Starting an auction").
    pub async fn start_auction(&self, auction_id: &AuctionId, now_ms: i64) -> Result<(), SchedulerError> {
        let mut auction = self
            .ledger
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| crate::errors::LedgerError::NotFound(auction_id.clone()))?;

        if auction.status != AuctionStatus::Pending {
            warn!("ignoring start-auction for {auction_id}, already {:?}", auction.status);
            return Ok(());
        }

        let first_spec = auction
            .round_specs
            .first()
            .ok_or_else(|| SchedulerError::NoRoundsLeft(auction_id.clone()))?
            .clone();

        auction.status = AuctionStatus::Active;
        auction.current_round = 1;
        let end_time = now_ms + (first_spec.duration_minutes as i64) * 60_000;
        auction.rounds = vec![RoundState {
            start_time: Some(now_ms),
            end_time: Some(end_time),
            items_count: first_spec.items_count,
            extensions_count: 0,
            completed: false,
            winner_bid_ids: Vec::new(),
        }];
        for spec in auction.round_specs.iter().skip(1) {
            auction.rounds.push(RoundState::pending(spec.items_count));
        }

        self.ledger.save_auction(&auction).await?;
        self.warm_up(&auction, now_ms).await?;

        info!("auction {auction_id} started, round 1 ends at {end_time}");
        let _ = self
            .event_bus
            .publish(
                auction_id,
                AuctionEvent::round_start(auction_id.clone(), 1, first_spec.items_count, now_ms, end_time),
            )
            .await;
        let _ = self
            .event_bus
            .publish(auction_id, self.auction_update_event(&auction))
            .await;
        Ok(())
    }

    pub async fn cancel_auction(&self, auction_id: &AuctionId) -> Result<(), SchedulerError> {
        let mut auction = self
            .ledger
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| crate::errors::LedgerError::NotFound(auction_id.clone()))?;

        let active_bids = self.ledger.list_active_bids(auction_id).await?;
        let frozen: Vec<RoundLoser> = active_bids
            .iter()
            .map(|b| RoundLoser {
                bid_id: b.id.clone(),
                user_id: b.user_id.clone(),
                amount: b.amount,
            })
            .collect();
        self.ledger.cancel_auction_refunds(auction_id, &frozen).await?;

        auction.status = AuctionStatus::Cancelled;
        self.ledger.save_auction(&auction).await?;
        self.cache.teardown(auction_id).await?;

        let _ = self
            .event_bus
            .publish(auction_id, self.auction_update_event(&auction))
            .await;
        Ok(())
    }

    /// Re-reads the cached round end time and extends it if the bid landed
    /// inside the anti-sniping window (§4.5). Narrows, but does not close,
    /// the race between this read and the next bid's precondition check —
    /// see the Design Notes' open question on this split.
    pub async fn consider_anti_sniping(
        &self,
        auction_id: &AuctionId,
        now_ms: i64,
    ) -> Result<bool, SchedulerError> {
        let Some(meta) = self.cache.get_meta(auction_id).await? else {
            return Ok(false);
        };
        if meta.extensions_count >= meta.max_extensions {
            return Ok(false);
        }
        let window_start = meta.round_end_time - meta.anti_sniping_window_ms;
        if now_ms < window_start || now_ms > meta.round_end_time {
            return Ok(false);
        }

        let new_end_time = meta.round_end_time + meta.anti_sniping_extension_ms;
        let new_extensions = meta.extensions_count + 1;
        let extended = self
            .cache
            .cas_round_end_time(auction_id, meta.round_end_time, new_end_time, new_extensions)
            .await?;

        if extended {
            if let Some(mut auction) = self.ledger.get_auction(auction_id).await? {
                if let Some(round) = auction.rounds.get_mut(auction.current_round as usize - 1) {
                    round.end_time = Some(new_end_time);
                    round.extensions_count = new_extensions;
                }
                let _ = self.ledger.save_auction(&auction).await;
            }
            metrics_update!(inc ROUND_EXTENSIONS_TOTAL);
            info!("auction {auction_id} round extended to {new_end_time} ({new_extensions} extensions)");
            let _ = self
                .event_bus
                .publish(
                    auction_id,
                    AuctionEvent::anti_sniping(auction_id.clone(), meta.current_round, new_end_time, new_extensions),
                )
                .await;
        }
        Ok(extended)
    }

    /// Emits one `countdown` tick and completes the round if its time has
    /// come, for every currently active auction. Called on a fixed cadence
    /// by the primary worker's background loop; also public so tests and
    /// the service façade can force a deterministic tick without waiting
    /// out the real interval.
    pub async fn tick_all(&self, now_ms: i64) -> Result<(), SchedulerError> {
        let auctions = self.ledger.list_active_auctions().await?;
        for auction in auctions {
            if let Err(err) = self.tick_one(&auction, now_ms).await {
                error!("scheduler tick failed for auction {}: {err}", auction.id);
            }
        }
        Ok(())
    }

    async fn tick_one(&self, auction: &Auction, now_ms: i64) -> Result<(), SchedulerError> {
        let Some(round_state) = auction.current_round_state() else {
            return Ok(());
        };
        let Some(end_time) = round_state.end_time else {
            return Ok(());
        };

        if now_ms >= end_time {
            self.complete_round(auction, now_ms).await?;
            return Ok(());
        }

        let time_left_seconds = ((end_time - now_ms).max(0)) / 1000;
        debug!("auction {} round {} has {}s left", auction.id, auction.current_round, time_left_seconds);
        let _ = self
            .event_bus
            .publish(
                &auction.id,
                AuctionEvent::countdown(auction.id.clone(), auction.current_round, end_time, now_ms),
            )
            .await;
        Ok(())
    }

    /// §4.5 "Round completion".
    async fn complete_round(&self, auction: &Auction, now_ms: i64) -> Result<(), SchedulerError> {
        let round_number = auction.current_round;
        let Some(round_spec) = auction.current_round_spec() else {
            return Ok(());
        };
        let k = round_spec.items_count as usize;

        let active_bids = self.ledger.list_active_bids(&auction.id).await?;
        let (winner_bids, loser_bids) = if active_bids.len() > k {
            active_bids.split_at(k)
        } else {
            (&active_bids[..], &active_bids[active_bids.len()..])
        };

        let winners: Vec<RoundWinner> = winner_bids
            .iter()
            .enumerate()
            .map(|(idx, bid)| RoundWinner {
                bid_id: bid.id.clone(),
                user_id: bid.user_id.clone(),
                amount: bid.amount,
                item_number: (idx + 1) as u32,
            })
            .collect();
        let losers: Vec<RoundLoser> = loser_bids
            .iter()
            .map(|bid| RoundLoser {
                bid_id: bid.id.clone(),
                user_id: bid.user_id.clone(),
                amount: bid.amount,
            })
            .collect();

        let winner_ids = retry_with_backoff!(
            self.ledger
                .complete_round_winners(&auction.id, round_number, &winners)
                .await,
            self.config.retry_attempts,
            self.config.retry_base_delay_ms
        )?;

        let loser_ids = self
            .ledger
            .complete_round_losers(&auction.id, round_number, &losers)
            .await?;
        if loser_ids.len() != losers.len() {
            warn!(
                "auction {} round {} refunded {}/{} losers, remainder retried next pass",
                auction.id,
                round_number,
                loser_ids.len(),
                losers.len()
            );
        }

        let mut auction = self
            .ledger
            .get_auction(&auction.id)
            .await?
            .ok_or_else(|| crate::errors::LedgerError::NotFound(auction.id.clone()))?;
        if let Some(round) = auction.rounds.get_mut(round_number as usize - 1) {
            round.completed = true;
            round.winner_bid_ids = winner_ids.clone();
        }

        let winner_summaries: Vec<WinnerSummary> = winners
            .iter()
            .map(|w| WinnerSummary {
                amount: w.amount,
                item_number: w.item_number,
            })
            .collect();
        let _ = self
            .event_bus
            .publish(
                &auction.id,
                AuctionEvent::round_complete(auction.id.clone(), round_number, winner_summaries),
            )
            .await;

        if (round_number as usize) < auction.round_specs.len() {
            let next_round = round_number + 1;
            let next_spec = auction.round_specs[next_round as usize - 1].clone();
            let end_time = now_ms + (next_spec.duration_minutes as i64) * 60_000;
            auction.current_round = next_round;
            if let Some(round) = auction.rounds.get_mut(next_round as usize - 1) {
                round.start_time = Some(now_ms);
                round.end_time = Some(end_time);
                round.extensions_count = 0;
            }
            self.ledger.save_auction(&auction).await?;
            // Re-warm from the ledger rather than patching `meta` in place:
            // round N's winners/losers were just resolved there, so at this
            // instant `list_active_bids` is empty for this auction and the
            // warm replaces the cache's balance/bid/leaderboard projections
            // with that post-resolution truth instead of carrying round-N
            // entries into round N+1.
            self.warm_up(&auction, now_ms).await?;

            info!("auction {} advanced to round {next_round}", auction.id);
            let _ = self
                .event_bus
                .publish(
                    &auction.id,
                    AuctionEvent::round_start(auction.id.clone(), next_round, next_spec.items_count, now_ms, end_time),
                )
                .await;
            let _ = self
                .event_bus
                .publish(&auction.id, self.auction_update_event(&auction))
                .await;
        } else {
            auction.status = AuctionStatus::Completed;
            self.ledger.save_auction(&auction).await?;
            self.cache.teardown(&auction.id).await?;

            info!("auction {} completed after {} rounds", auction.id, auction.round_specs.len());
            let _ = self
                .event_bus
                .publish(
                    &auction.id,
                    AuctionEvent::auction_complete(auction.id.clone(), now_ms, auction.round_specs.len() as u32),
                )
                .await;
        }

        Ok(())
    }

    fn auction_update_event(&self, auction: &Auction) -> AuctionEvent {
        let rounds = auction
            .round_specs
            .iter()
            .zip(auction.rounds.iter())
            .enumerate()
            .map(|(idx, (spec, state))| crate::events::RoundSummary {
                round_number: (idx + 1) as u32,
                items_count: spec.items_count,
                start_time: state.start_time.map(crate::events::iso),
                end_time: state.end_time.map(crate::events::iso),
                completed: state.completed,
                extensions_count: state.extensions_count,
            })
            .collect();
        AuctionEvent::AuctionUpdate {
            id: auction.id.clone(),
            status: format!("{:?}", auction.status).to_lowercase(),
            current_round: auction.current_round,
            rounds,
        }
    }
}

/// Orchestrates the scheduler's two background loops (§4.5's countdown timer
/// and round completion) the way `TransactionsLoadingCtx::setup_and_run`
/// spawns its loaders: a thin `Ctx` marker type whose constructor spawns the
/// tasks and returns immediately.
pub struct SchedulerCtx;

impl SchedulerCtx {
    pub async fn setup_and_run(register: &Register, now_ms_fn: fn() -> i64) -> Result<SchedulerHandle> {
        let scheduler = Arc::new(Scheduler::new(
            register.cache.clone(),
            register.ledger.clone(),
            register.event_bus.clone(),
            register.config.get_scheduler_config().clone(),
            register.config.get_anti_sniping_defaults().clone(),
        ));
        let coordinator = register.coordinator.clone();

        {
            let scheduler = scheduler.clone();
            let coordinator = coordinator.clone();
            let tick_interval = Duration::from_millis(register.config.get_scheduler_config().tick_interval_ms);
            tokio::spawn(async move {
                loop {
                    if coordinator.is_primary() {
                        if let Err(err) = scheduler.tick_all(now_ms_fn()).await {
                            error!("scheduler tick failed: {err}");
                        }
                    }
                    tokio::time::sleep(tick_interval).await;
                }
            });
        }

        {
            let scheduler = scheduler.clone();
            let coordinator = coordinator.clone();
            let mut messages = coordinator.channel.subscribe().await?;
            tokio::spawn(async move {
                while let Some(msg) = messages.recv().await {
                    if !coordinator.is_primary() {
                        continue;
                    }
                    Self::handle_coordination_message(&scheduler, msg, now_ms_fn()).await;
                }
            });
        }

        info!("round scheduler spawned");
        Ok(SchedulerHandle { scheduler, coordinator })
    }

    async fn handle_coordination_message(scheduler: &Arc<Scheduler>, msg: CoordinationMessage, now_ms: i64) {
        match msg.operation.as_str() {
            "start-auction" => {
                if let Some(auction_id) = msg.auction_id {
                    if let Err(err) = scheduler.start_auction(&auction_id, now_ms).await {
                        error!("failed to start auction {auction_id}: {err}");
                    }
                }
            }
            "cancel-auction" => {
                if let Some(auction_id) = msg.auction_id {
                    if let Err(err) = scheduler.cancel_auction(&auction_id).await {
                        error!("failed to cancel auction {auction_id}: {err}");
                    }
                }
            }
            other => warn!("ignoring unknown coordination operation {other}"),
        }
    }
}

/// Handle given to callers outside the scheduler's own loops (the socket
/// layer, the service façade). Primary-only operations are executed
/// directly when this worker holds the lease, and forwarded over C8
/// otherwise (§4.8).
#[derive(Clone)]
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    coordinator: Arc<Coordinator>,
}

impl SchedulerHandle {
    /// Builds a handle without spawning `setup_and_run`'s background loops —
    /// used by tests and by the service façade, both of which only need the
    /// always-local operations (`consider_anti_sniping`, `warm_up`).
    pub fn new(scheduler: Arc<Scheduler>, coordinator: Arc<Coordinator>) -> Self {
        SchedulerHandle { scheduler, coordinator }
    }

    pub async fn start_auction(&self, auction_id: &AuctionId, now_ms: i64) -> Result<()> {
        if self.coordinator.is_primary() {
            self.scheduler.start_auction(auction_id, now_ms).await?;
        } else {
            self.coordinator
                .channel
                .publish(CoordinationMessage {
                    operation: "start-auction".to_string(),
                    auction_id: Some(auction_id.clone()),
                    payload: serde_json::json!({}),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn cancel_auction(&self, auction_id: &AuctionId) -> Result<()> {
        if self.coordinator.is_primary() {
            self.scheduler.cancel_auction(auction_id).await?;
        } else {
            self.coordinator
                .channel
                .publish(CoordinationMessage {
                    operation: "cancel-auction".to_string(),
                    auction_id: Some(auction_id.clone()),
                    payload: serde_json::json!({}),
                })
                .await?;
        }
        Ok(())
    }

    /// Always runs locally regardless of primary status: the scheduler is
    /// the sole *logical* writer of `roundEndTime`, but any worker's bid
    /// path may trigger the extension (§9 open question).
    pub async fn consider_anti_sniping(&self, auction_id: &AuctionId, now_ms: i64) -> Result<bool> {
        Ok(self.scheduler.consider_anti_sniping(auction_id, now_ms).await?)
    }

    pub async fn warm_up(&self, auction: &Auction, now_ms: i64) -> Result<()> {
        Ok(self.scheduler.warm_up(auction, now_ms).await?)
    }

    /// No-op on a non-primary worker: ticking is owned entirely by whichever
    /// worker's background loop holds the lease (§4.8), unlike
    /// `consider_anti_sniping` which any worker may trigger.
    pub async fn tick_all(&self, now_ms: i64) -> Result<()> {
        if self.coordinator.is_primary() {
            self.scheduler.tick_all(now_ms).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store::MemoryAuctionStore;
    use crate::coordinator::{AlwaysPrimaryLease, Coordinator, LocalCoordinationChannel};
    use crate::events::LocalEventBus;
    use crate::ledger::memory_store::MemoryLedgerStore;
    use crate::model::{Auction, RoundSpec};

    fn test_scheduler() -> (Scheduler, Arc<dyn LedgerStore>, Arc<dyn AtomicAuctionStore>) {
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
        let anti_sniping_defaults = AntiSnipingDefaults {
            window_ms: 60_000,
            extension_ms: 60_000,
            max_extensions: 5,
        };
        let scheduler = Scheduler::new(cache.clone(), ledger.clone(), event_bus, config, anti_sniping_defaults);
        (scheduler, ledger, cache)
    }

    fn seed_auction() -> Auction {
        Auction {
            id: "a1".to_string(),
            title: "Test".to_string(),
            owner: "owner".to_string(),
            total_items: 3,
            round_specs: vec![
                RoundSpec { items_count: 2, duration_minutes: 1 },
                RoundSpec { items_count: 1, duration_minutes: 1 },
            ],
            min_bid_amount: 100,
            min_bid_increment: 10,
            anti_sniping_window_ms: 60_000,
            anti_sniping_extension_ms: 60_000,
            max_extensions: 5,
            bots_enabled: false,
            bot_count: 0,
            status: AuctionStatus::Pending,
            current_round: 0,
            rounds: Vec::new(),
        }
    }

    #[tokio::test]
    async fn starting_an_auction_sets_round_one_and_warms_cache() {
        let (scheduler, ledger, cache) = test_scheduler();
        ledger.insert_auction(&seed_auction()).await.unwrap();

        scheduler.start_auction(&"a1".to_string(), 0).await.unwrap();

        let auction = ledger.get_auction(&"a1".to_string()).await.unwrap().unwrap();
        assert_eq!(auction.status, AuctionStatus::Active);
        assert_eq!(auction.current_round, 1);
        assert!(cache.get_meta(&"a1".to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completing_a_round_splits_winners_and_losers_by_rank() {
        let (scheduler, ledger, cache) = test_scheduler();
        let mut auction = seed_auction();
        auction.status = AuctionStatus::Active;
        auction.current_round = 1;
        auction.rounds = vec![
            RoundState { start_time: Some(0), end_time: Some(1000), items_count: 2, extensions_count: 0, completed: false, winner_bid_ids: vec![] },
            RoundState::pending(1),
        ];
        ledger.insert_auction(&auction).await.unwrap();

        for (i, amount) in [(1, 300i64), (2, 200), (3, 100)] {
            let user_id = format!("u{i}");
            ledger.ensure_user(&user_id, &user_id).await.unwrap();
            ledger.deposit(&user_id, 1000).await.unwrap();
            ledger.freeze(&user_id, amount, &auction.id, &format!("b{i}")).await.unwrap();
            ledger
                .upsert_active_bid(&crate::model::Bid {
                    id: format!("b{i}"),
                    auction_id: auction.id.clone(),
                    user_id,
                    amount,
                    status: crate::model::BidStatus::Active,
                    won_round: None,
                    item_number: None,
                    created_at: i as i64,
                    updated_at: i as i64,
                })
                .await
                .unwrap();
        }

        scheduler.warm_up(&auction, 0).await.unwrap();
        assert_eq!(cache.get_bid(&auction.id, &"u3".to_string()).await.unwrap().unwrap().amount, 100);

        scheduler.complete_round(&auction, 1500).await.unwrap();

        let u1 = ledger.get_user(&"u1".to_string()).await.unwrap().unwrap();
        let u3 = ledger.get_user(&"u3".to_string()).await.unwrap().unwrap();
        assert_eq!(u1.frozen_balance, 0, "winner's frozen money left the system");
        assert_eq!(u3.frozen_balance, 0, "loser was refunded");
        assert_eq!(u3.balance, 1000, "loser's refund restored their balance");

        let updated = ledger.get_auction(&auction.id).await.unwrap().unwrap();
        assert!(updated.rounds[0].completed);
        assert_eq!(updated.rounds[0].winner_bid_ids.len(), 2);
        assert_eq!(updated.current_round, 2);

        // Round 2's cache starts clean: the round-1 loser's bid/leaderboard
        // entry must not survive into the next round, and a round-1 winner
        // carries no leftover cached projection either since both were just
        // resolved in the ledger.
        assert!(cache.get_bid(&auction.id, &"u3".to_string()).await.unwrap().is_none());
        assert!(cache.get_bid(&auction.id, &"u1".to_string()).await.unwrap().is_none());
        let leaderboard = cache.leaderboard_range(&auction.id, 0, 10).await.unwrap();
        assert!(leaderboard.is_empty(), "round 2's leaderboard must start empty");
        let meta = cache.get_meta(&auction.id).await.unwrap().unwrap();
        assert_eq!(meta.current_round, 2);
        assert_eq!(meta.items_in_round, 1);
    }

    #[tokio::test]
    async fn five_bidders_two_rounds_losers_refunded_round_two_admits_fresh_bids_e5() {
        let (scheduler, ledger, cache) = test_scheduler();
        let mut auction = seed_auction();
        auction.total_items = 5;
        auction.round_specs = vec![
            RoundSpec { items_count: 3, duration_minutes: 1 },
            RoundSpec { items_count: 2, duration_minutes: 1 },
        ];
        auction.status = AuctionStatus::Active;
        auction.current_round = 1;
        auction.rounds = vec![
            RoundState { start_time: Some(0), end_time: Some(1000), items_count: 3, extensions_count: 0, completed: false, winner_bid_ids: vec![] },
            RoundState::pending(2),
        ];
        ledger.insert_auction(&auction).await.unwrap();

        for (i, amount) in [(1, 100i64), (2, 110), (3, 120), (4, 130), (5, 140)] {
            let user_id = format!("u{i}");
            ledger.ensure_user(&user_id, &user_id).await.unwrap();
            ledger.deposit(&user_id, 1000).await.unwrap();
            ledger.freeze(&user_id, amount, &auction.id, &format!("b{i}")).await.unwrap();
            ledger
                .upsert_active_bid(&crate::model::Bid {
                    id: format!("b{i}"),
                    auction_id: auction.id.clone(),
                    user_id,
                    amount,
                    status: crate::model::BidStatus::Active,
                    won_round: None,
                    item_number: None,
                    created_at: i as i64,
                    updated_at: i as i64,
                })
                .await
                .unwrap();
        }

        scheduler.complete_round(&auction, 1500).await.unwrap();

        let updated = ledger.get_auction(&auction.id).await.unwrap().unwrap();
        assert!(updated.rounds[0].completed);
        assert_eq!(updated.rounds[0].winner_bid_ids.len(), 3, "round 1 (K=3) admits the top 3 bidders");
        assert_eq!(updated.current_round, 2);

        // u3, u4, u5 (amounts 120/130/140) won; u1, u2 (100/110) lost and
        // were refunded in full.
        for losing_user in ["u1", "u2"] {
            let user = ledger.get_user(&losing_user.to_string()).await.unwrap().unwrap();
            assert_eq!(user.frozen_balance, 0, "{losing_user} refunded");
            assert_eq!(user.balance, 1000, "{losing_user} has their full deposit back");
        }
        for winning_user in ["u3", "u4", "u5"] {
            let user = ledger.get_user(&winning_user.to_string()).await.unwrap().unwrap();
            assert_eq!(user.frozen_balance, 0, "{winning_user}'s frozen bid left the system on win");
        }

        // Round 2 starts from a clean slate in the cache too.
        let leaderboard = cache.leaderboard_range(&auction.id, 0, 10).await.unwrap();
        assert!(leaderboard.is_empty());

        // Round 2 (K=2) admits a fresh bid from one of round 1's refunded
        // bidders cleanly: the ledger freeze succeeds against their restored
        // balance, and re-warming the cache surfaces it under round 2's meta.
        ledger.freeze(&"u1".to_string(), 200, &auction.id, &"b1-r2".to_string()).await.unwrap();
        ledger
            .upsert_active_bid(&crate::model::Bid {
                id: "b1-r2".to_string(),
                auction_id: auction.id.clone(),
                user_id: "u1".to_string(),
                amount: 200,
                status: crate::model::BidStatus::Active,
                won_round: None,
                item_number: None,
                created_at: 1600,
                updated_at: 1600,
            })
            .await
            .unwrap();

        scheduler.warm_up(&updated, 1600).await.unwrap();
        let bid = cache.get_bid(&auction.id, &"u1".to_string()).await.unwrap().unwrap();
        assert_eq!(bid.amount, 200);
        let meta = cache.get_meta(&auction.id).await.unwrap().unwrap();
        assert_eq!(meta.current_round, 2);
        assert_eq!(meta.items_in_round, 2);
    }

    #[tokio::test]
    async fn anti_sniping_extends_the_round_inside_the_window_e4() {
        let (scheduler, ledger, cache) = test_scheduler();
        let mut auction = seed_auction();
        auction.status = AuctionStatus::Active;
        auction.current_round = 1;
        auction.rounds = vec![RoundState::pending(2), RoundState::pending(1)];
        auction.rounds[0].start_time = Some(0);
        auction.rounds[0].end_time = Some(100_000);
        ledger.insert_auction(&auction).await.unwrap();
        scheduler.warm_up(&auction, 0).await.unwrap();

        // 30s inside the 60s anti-sniping window.
        let extended = scheduler.consider_anti_sniping(&auction.id, 70_000).await.unwrap();
        assert!(extended, "bid inside the anti-sniping window must extend the round");

        let meta = cache.get_meta(&auction.id).await.unwrap().unwrap();
        assert_eq!(meta.round_end_time, 160_000);
        assert_eq!(meta.extensions_count, 1);

        let updated = ledger.get_auction(&auction.id).await.unwrap().unwrap();
        assert_eq!(updated.rounds[0].end_time, Some(160_000));
        assert_eq!(updated.rounds[0].extensions_count, 1);
    }

    #[tokio::test]
    async fn anti_sniping_does_not_extend_outside_the_window() {
        let (scheduler, ledger, cache) = test_scheduler();
        let mut auction = seed_auction();
        auction.status = AuctionStatus::Active;
        auction.current_round = 1;
        auction.rounds = vec![RoundState::pending(2), RoundState::pending(1)];
        auction.rounds[0].start_time = Some(0);
        auction.rounds[0].end_time = Some(100_000);
        ledger.insert_auction(&auction).await.unwrap();
        scheduler.warm_up(&auction, 0).await.unwrap();

        // Well before the 60s window: no extension.
        let extended = scheduler.consider_anti_sniping(&auction.id, 10_000).await.unwrap();
        assert!(!extended);
        let meta = cache.get_meta(&auction.id).await.unwrap().unwrap();
        assert_eq!(meta.round_end_time, 100_000);
        assert_eq!(meta.extensions_count, 0);
    }
}
