//! In-process backend for `AtomicAuctionStore`: auctions are sharded across
//! owned Tokio tasks ("actors"), one per auction id, each holding its own
//! state and driven through an mpsc handle. This is the teacher's
//! actor-with-handle pattern (`QueueManagerHandle`, `LoadingStatusCheckerHandle`,
//! ...) applied to the hot-cache keyspace instead of a Postgres connection,
//! and it is the backend the Design Notes call out as an alternative to a
//! Redis script: "an in-process sharded actor".
//!
//! It backs unit/integration tests and small single-worker deployments; the
//! precondition chain below is the Rust-level specification the
//! `place_bid.lua` script (see `redis_store`) is checked against.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{BidError, CacheError};
use crate::model::score::encode;
use crate::model::{AuctionId, AuctionStatus, UserId};

use super::{AtomicAuctionStore, BalanceProjection, BidProjection, CacheMeta, PlaceBidOutcome};

struct ShardState {
    meta: CacheMeta,
    balances: HashMap<UserId, BalanceProjection>,
    bids: HashMap<UserId, BidProjection>,
    dirty_users: HashSet<UserId>,
}

enum ShardCmd {
    WarmUp {
        meta: CacheMeta,
        balances: Vec<(UserId, BalanceProjection)>,
        bids: Vec<(UserId, BidProjection)>,
        respond: oneshot::Sender<()>,
    },
    GetMeta {
        respond: oneshot::Sender<CacheMeta>,
    },
    GetBalance {
        user_id: UserId,
        respond: oneshot::Sender<Option<BalanceProjection>>,
    },
    GetBid {
        user_id: UserId,
        respond: oneshot::Sender<Option<BidProjection>>,
    },
    PlaceBidFast {
        user_id: UserId,
        amount: i64,
        now_ms: i64,
        respond: oneshot::Sender<Result<PlaceBidOutcome, BidError>>,
    },
    LeaderboardRange {
        offset: usize,
        limit: usize,
        respond: oneshot::Sender<Vec<(UserId, i64)>>,
    },
    DirtyUsers {
        respond: oneshot::Sender<Vec<UserId>>,
    },
    ClearDirty {
        user_ids: Vec<UserId>,
        respond: oneshot::Sender<()>,
    },
    CasRoundEndTime {
        expected_prev_end_time: i64,
        new_end_time: i64,
        extensions_count: u32,
        respond: oneshot::Sender<bool>,
    },
    SetStatus {
        status: AuctionStatus,
        respond: oneshot::Sender<()>,
    },
    Teardown {
        respond: oneshot::Sender<()>,
    },
}

struct Shard {
    receiver: mpsc::Receiver<ShardCmd>,
    state: ShardState,
}

impl Shard {
    async fn run(mut self) {
        while let Some(cmd) = self.receiver.recv().await {
            if self.handle(cmd) {
                break;
            }
        }
    }

    /// Returns `true` when the shard should shut down after responding.
    fn handle(&mut self, cmd: ShardCmd) -> bool {
        match cmd {
            ShardCmd::WarmUp {
                meta,
                balances,
                bids,
                respond,
            } => {
                if meta.warm_version >= self.state.meta.warm_version {
                    self.state.meta = meta;
                    self.state.balances = balances.into_iter().collect();
                    self.state.bids = bids.into_iter().collect();
                }
                let _ = respond.send(());
            }
            ShardCmd::GetMeta { respond } => {
                let _ = respond.send(self.state.meta.clone());
            }
            ShardCmd::GetBalance { user_id, respond } => {
                let _ = respond.send(self.state.balances.get(&user_id).copied());
            }
            ShardCmd::GetBid { user_id, respond } => {
                let _ = respond.send(self.state.bids.get(&user_id).copied());
            }
            ShardCmd::PlaceBidFast {
                user_id,
                amount,
                now_ms,
                respond,
            } => {
                let _ = respond.send(self.place_bid_fast(&user_id, amount, now_ms));
            }
            ShardCmd::LeaderboardRange {
                offset,
                limit,
                respond,
            } => {
                let mut ranked: Vec<(UserId, i64)> = self
                    .state
                    .bids
                    .iter()
                    .map(|(uid, b)| (uid.clone(), encode(b.amount, b.created_at)))
                    .collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1));
                let _ = respond.send(ranked.into_iter().skip(offset).take(limit).collect());
            }
            ShardCmd::DirtyUsers { respond } => {
                let _ = respond.send(self.state.dirty_users.iter().cloned().collect());
            }
            ShardCmd::ClearDirty { user_ids, respond } => {
                for uid in &user_ids {
                    self.state.dirty_users.remove(uid);
                }
                let _ = respond.send(());
            }
            ShardCmd::CasRoundEndTime {
                expected_prev_end_time,
                new_end_time,
                extensions_count,
                respond,
            } => {
                let ok = self.state.meta.round_end_time == expected_prev_end_time;
                if ok {
                    self.state.meta.round_end_time = new_end_time;
                    self.state.meta.extensions_count = extensions_count;
                }
                let _ = respond.send(ok);
            }
            ShardCmd::SetStatus { status, respond } => {
                self.state.meta.status = status;
                let _ = respond.send(());
            }
            ShardCmd::Teardown { respond } => {
                let _ = respond.send(());
                return true;
            }
        }
        false
    }

    /// The Rust mirror of the Lua script's precondition chain and effects,
    /// §4.1 steps 1-6 and the "Effects on success" block. Preconditions 1-2
    /// (warmed, active) are guaranteed by construction here: a shard only
    /// exists after `warm_up`, and callers observe `NOT_WARMED` by getting no
    /// shard at all (see `MemoryAuctionStore::place_bid_fast`).
    fn place_bid_fast(
        &mut self,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, BidError> {
        let meta = &self.state.meta;
        if meta.status != AuctionStatus::Active {
            return Err(BidError::NotActive);
        }
        if now_ms > meta.round_end_time {
            return Err(BidError::RoundEnded);
        }
        if amount < meta.min_bid_amount {
            return Err(BidError::MinBid);
        }

        let existing = self.state.bids.get(user_id).copied();
        if let Some(existing) = existing {
            if amount < existing.amount + meta.min_bid_increment {
                return Err(BidError::BidTooLow);
            }
        }

        let delta = amount - existing.map(|b| b.amount).unwrap_or(0);
        let balance = self
            .state
            .balances
            .entry(user_id.clone())
            .or_insert(BalanceProjection {
                available: 0,
                frozen: 0,
            });
        if balance.available < delta {
            return Err(BidError::InsufficientBalance);
        }

        balance.available -= delta;
        balance.frozen += delta;

        let created_at = existing.map(|b| b.created_at).unwrap_or(now_ms);
        let version = existing.map(|b| b.version + 1).unwrap_or(1);
        self.state.bids.insert(
            user_id.clone(),
            BidProjection {
                amount,
                created_at,
                version,
            },
        );
        self.state.dirty_users.insert(user_id.clone());

        Ok(PlaceBidOutcome {
            new_amount: amount,
            previous_amount: existing.map(|b| b.amount).unwrap_or(0),
            frozen_delta: delta,
            is_new_bid: existing.is_none(),
            round_end_time: meta.round_end_time,
            anti_sniping_window_ms: meta.anti_sniping_window_ms,
            anti_sniping_extension_ms: meta.anti_sniping_extension_ms,
            max_extensions: meta.max_extensions,
            items_in_round: meta.items_in_round,
            current_round: meta.current_round,
        })
    }
}

#[derive(Clone)]
struct ShardHandle {
    sender: mpsc::Sender<ShardCmd>,
}

impl ShardHandle {
    fn spawn(meta: CacheMeta) -> Self {
        let (sender, receiver) = mpsc::channel(256);
        let shard = Shard {
            receiver,
            state: ShardState {
                meta,
                balances: HashMap::new(),
                bids: HashMap::new(),
                dirty_users: HashSet::new(),
            },
        };
        tokio::spawn(shard.run());
        ShardHandle { sender }
    }
}

/// The in-process `AtomicAuctionStore` backend. `shards` maps an auction id
/// to the mpsc handle of its owning task; lookup/insert is guarded by a
/// plain `std::sync::Mutex` since the map is only ever touched for the
/// instant it takes to clone a `Sender` or insert one, never across an
/// `.await`.
#[derive(Default)]
pub struct MemoryAuctionStore {
    shards: Mutex<HashMap<AuctionId, ShardHandle>>,
}

impl MemoryAuctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_for(&self, auction_id: &AuctionId) -> Option<ShardHandle> {
        self.shards.lock().unwrap().get(auction_id).cloned()
    }
}

#[async_trait]
impl AtomicAuctionStore for MemoryAuctionStore {
    async fn warm_up(
        &self,
        auction_id: &AuctionId,
        meta: CacheMeta,
        balances: Vec<(UserId, BalanceProjection)>,
        bids: Vec<(UserId, BidProjection)>,
    ) -> Result<(), CacheError> {
        let handle = {
            let mut shards = self.shards.lock().unwrap();
            shards
                .entry(auction_id.clone())
                .or_insert_with(|| ShardHandle::spawn(meta.clone()))
                .clone()
        };
        let (respond, recv) = oneshot::channel();
        handle
            .sender
            .send(ShardCmd::WarmUp {
                meta,
                balances,
                bids,
                respond,
            })
            .await
            .map_err(|_| CacheError::NotFound(auction_id.clone()))?;
        recv.await.map_err(|_| CacheError::NotFound(auction_id.clone()))
    }

    async fn get_meta(&self, auction_id: &AuctionId) -> Result<Option<CacheMeta>, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(None);
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle.sender.send(ShardCmd::GetMeta { respond }).await;
        Ok(recv.await.ok())
    }

    async fn get_balance(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BalanceProjection>, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(None);
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::GetBalance {
                user_id: user_id.clone(),
                respond,
            })
            .await;
        Ok(recv.await.unwrap_or(None))
    }

    async fn get_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BidProjection>, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(None);
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::GetBid {
                user_id: user_id.clone(),
                respond,
            })
            .await;
        Ok(recv.await.unwrap_or(None))
    }

    async fn place_bid_fast(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, CacheError> {
        if amount <= 0 {
            return Err(CacheError::Bid(BidError::MinBid));
        }
        let Some(handle) = self.handle_for(auction_id) else {
            return Err(CacheError::Bid(BidError::NotWarmed));
        };
        let (respond, recv) = oneshot::channel();
        handle
            .sender
            .send(ShardCmd::PlaceBidFast {
                user_id: user_id.clone(),
                amount,
                now_ms,
                respond,
            })
            .await
            .map_err(|_| CacheError::Bid(BidError::NotWarmed))?;
        recv.await
            .map_err(|_| CacheError::Bid(BidError::NotWarmed))?
            .map_err(CacheError::Bid)
    }

    async fn leaderboard_range(
        &self,
        auction_id: &AuctionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(UserId, i64)>, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(Vec::new());
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::LeaderboardRange {
                offset,
                limit,
                respond,
            })
            .await;
        Ok(recv.await.unwrap_or_default())
    }

    async fn dirty_users(&self, auction_id: &AuctionId) -> Result<Vec<UserId>, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(Vec::new());
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle.sender.send(ShardCmd::DirtyUsers { respond }).await;
        Ok(recv.await.unwrap_or_default())
    }

    async fn clear_dirty(
        &self,
        auction_id: &AuctionId,
        user_ids: &[UserId],
    ) -> Result<(), CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Ok(());
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::ClearDirty {
                user_ids: user_ids.to_vec(),
                respond,
            })
            .await;
        let _ = recv.await;
        Ok(())
    }

    async fn cas_round_end_time(
        &self,
        auction_id: &AuctionId,
        expected_prev_end_time: i64,
        new_end_time: i64,
        extensions_count: u32,
    ) -> Result<bool, CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Err(CacheError::NotFound(auction_id.clone()));
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::CasRoundEndTime {
                expected_prev_end_time,
                new_end_time,
                extensions_count,
                respond,
            })
            .await;
        Ok(recv.await.unwrap_or(false))
    }

    async fn set_status(
        &self,
        auction_id: &AuctionId,
        status: AuctionStatus,
    ) -> Result<(), CacheError> {
        let Some(handle) = self.handle_for(auction_id) else {
            return Err(CacheError::NotFound(auction_id.clone()));
        };
        let (respond, recv) = oneshot::channel();
        let _ = handle
            .sender
            .send(ShardCmd::SetStatus { status, respond })
            .await;
        let _ = recv.await;
        Ok(())
    }

    async fn teardown(&self, auction_id: &AuctionId) -> Result<(), CacheError> {
        let handle = self.shards.lock().unwrap().remove(auction_id);
        if let Some(handle) = handle {
            let (respond, recv) = oneshot::channel();
            let _ = handle.sender.send(ShardCmd::Teardown { respond }).await;
            let _ = recv.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(round_end_time: i64) -> CacheMeta {
        CacheMeta {
            min_bid_amount: 100,
            min_bid_increment: 10,
            status: AuctionStatus::Active,
            current_round: 1,
            round_end_time,
            items_in_round: 1,
            anti_sniping_window_ms: 60_000,
            anti_sniping_extension_ms: 60_000,
            max_extensions: 5,
            extensions_count: 0,
            warm_version: 1,
        }
    }

    async fn warmed_store(round_end_time: i64) -> MemoryAuctionStore {
        let store = MemoryAuctionStore::new();
        store
            .warm_up(&"a1".to_string(), meta(round_end_time), vec![], vec![])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn not_warmed_before_warm_up() {
        let store = MemoryAuctionStore::new();
        let err = store
            .place_bid_fast(&"missing".to_string(), &"u1".to_string(), 100, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Bid(BidError::NotWarmed)));
    }

    #[tokio::test]
    async fn tie_break_e1() {
        let store = warmed_store(1_000_000).await;
        store
            .warm_up(
                &"a1".to_string(),
                meta(1_000_000),
                vec![
                    ("a".to_string(), BalanceProjection { available: 1000, frozen: 0 }),
                    ("b".to_string(), BalanceProjection { available: 1000, frozen: 0 }),
                ],
                vec![],
            )
            .await
            .unwrap();

        let a = store
            .place_bid_fast(&"a1".to_string(), &"a".to_string(), 500, 0)
            .await
            .unwrap();
        assert_eq!(a.new_amount, 500);

        let b = store
            .place_bid_fast(&"a1".to_string(), &"b".to_string(), 500, 2)
            .await
            .unwrap_err();
        assert!(matches!(b, CacheError::Bid(BidError::BidTooLow)));
    }

    #[tokio::test]
    async fn incremental_freeze_preserves_total_e2() {
        let store = warmed_store(1_000_000).await;
        store
            .warm_up(
                &"a1".to_string(),
                meta(1_000_000),
                vec![("u".to_string(), BalanceProjection { available: 2000, frozen: 0 })],
                vec![],
            )
            .await
            .unwrap();

        store
            .place_bid_fast(&"a1".to_string(), &"u".to_string(), 500, 0)
            .await
            .unwrap();
        let bal = store
            .get_balance(&"a1".to_string(), &"u".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((bal.available, bal.frozen), (1500, 500));

        store
            .place_bid_fast(&"a1".to_string(), &"u".to_string(), 800, 1)
            .await
            .unwrap();
        let bal = store
            .get_balance(&"a1".to_string(), &"u".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((bal.available, bal.frozen), (1200, 800));
        assert_eq!(bal.available + bal.frozen, 2000);
    }

    #[tokio::test]
    async fn round_ended_boundary() {
        let store = warmed_store(1000).await;
        store
            .warm_up(
                &"a1".to_string(),
                meta(1000),
                vec![("u".to_string(), BalanceProjection { available: 1000, frozen: 0 })],
                vec![],
            )
            .await
            .unwrap();

        store
            .place_bid_fast(&"a1".to_string(), &"u".to_string(), 200, 999)
            .await
            .unwrap();

        let err = store
            .place_bid_fast(&"a1".to_string(), &"u".to_string(), 300, 1001)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Bid(BidError::RoundEnded)));
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected_without_mutation() {
        let store = warmed_store(1_000_000).await;
        store
            .warm_up(
                &"a1".to_string(),
                meta(1_000_000),
                vec![("u".to_string(), BalanceProjection { available: 100, frozen: 0 })],
                vec![],
            )
            .await
            .unwrap();

        let err = store
            .place_bid_fast(&"a1".to_string(), &"u".to_string(), 500, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Bid(BidError::InsufficientBalance)));

        let bal = store
            .get_balance(&"a1".to_string(), &"u".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((bal.available, bal.frozen), (100, 0));
    }
}
