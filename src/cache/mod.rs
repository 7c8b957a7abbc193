//! C1 (Atomic Bid Script) + C2 (Hot Cache) behind one trait.
//!
//! Mirrors the teacher's `solana_client::SolanaClient` trait + factory
//! function: every script site is a method on `AtomicAuctionStore`, so the
//! execution backend (Redis Lua script vs. an in-process sharded actor) can
//! be swapped without touching callers. See the Design Notes' rewrite of
//! "Lua-script call sites in many places".

pub mod memory_store;
pub mod redis_store;

use crate::errors::CacheError;
use crate::model::{AuctionId, AuctionStatus, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceProjection {
    pub available: i64,
    pub frozen: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BidProjection {
    pub amount: i64,
    pub created_at: i64,
    pub version: u64,
}

/// The warm cache's view of an auction's current round, as consulted by
/// every `placeBidFast` precondition (§4.1) and refreshed by the scheduler
/// on round transitions and anti-sniping extensions (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub min_bid_amount: i64,
    pub min_bid_increment: i64,
    pub status: AuctionStatus,
    pub current_round: u32,
    pub round_end_time: i64,
    pub items_in_round: u32,
    pub anti_sniping_window_ms: i64,
    pub anti_sniping_extension_ms: i64,
    pub max_extensions: u32,
    pub extensions_count: u32,
    /// Bumped on every warm-up so a concurrent double warm-up converges on
    /// whichever write happened last (§4.4: "warm-up must be idempotent").
    pub warm_version: u64,
}

/// Everything `placeBidFast` needs to report back to its caller on success,
/// per the return shape in §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBidOutcome {
    pub new_amount: i64,
    pub previous_amount: i64,
    pub frozen_delta: i64,
    pub is_new_bid: bool,
    pub round_end_time: i64,
    pub anti_sniping_window_ms: i64,
    pub anti_sniping_extension_ms: i64,
    pub max_extensions: u32,
    pub items_in_round: u32,
    pub current_round: u32,
}

#[async_trait]
pub trait AtomicAuctionStore: Send + Sync {
    /// Idempotent warm-up: populate `meta`, per-user `balance`/`bid`, and the
    /// `leaderboard` from ledger-sourced data. `warm_version` must be
    /// monotonically applied: a warm-up call carrying a lower-or-equal
    /// version than what is already cached is a no-op (§4.4, §8 idempotence
    /// law).
    async fn warm_up(
        &self,
        auction_id: &AuctionId,
        meta: CacheMeta,
        balances: Vec<(UserId, BalanceProjection)>,
        bids: Vec<(UserId, BidProjection)>,
    ) -> Result<(), CacheError>;

    async fn get_meta(&self, auction_id: &AuctionId) -> Result<Option<CacheMeta>, CacheError>;

    async fn get_balance(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BalanceProjection>, CacheError>;

    async fn get_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BidProjection>, CacheError>;

    /// §4.1: the atomic bid admission script. `now_ms` is passed in (rather
    /// than read server-side) so callers and tests can drive exact boundary
    /// timings (§8 "boundary behaviors").
    async fn place_bid_fast(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, CacheError>;

    /// Top `limit` leaderboard entries starting at `offset`, ordered by score
    /// descending (ties already resolved by `createdAt`, per the encoding in
    /// `model::score`).
    async fn leaderboard_range(
        &self,
        auction_id: &AuctionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(UserId, i64)>, CacheError>;

    async fn dirty_users(&self, auction_id: &AuctionId) -> Result<Vec<UserId>, CacheError>;

    /// Clears exactly the given user ids from the dirty-set, never the whole
    /// set (§4.4: other workers may add entries concurrently).
    async fn clear_dirty(
        &self,
        auction_id: &AuctionId,
        user_ids: &[UserId],
    ) -> Result<(), CacheError>;

    /// CAS the round end time: succeeds only if the currently-cached end time
    /// equals `expected_prev_end_time`. Used by the scheduler's anti-sniping
    /// extension writer (§4.5) and by plain round-to-round advancement.
    async fn cas_round_end_time(
        &self,
        auction_id: &AuctionId,
        expected_prev_end_time: i64,
        new_end_time: i64,
        extensions_count: u32,
    ) -> Result<bool, CacheError>;

    async fn set_status(
        &self,
        auction_id: &AuctionId,
        status: AuctionStatus,
    ) -> Result<(), CacheError>;

    /// Destroys every hot-cache key for this auction (§3 "Ownership": cache
    /// entries die with the auction's lifecycle on completion/cancellation).
    async fn teardown(&self, auction_id: &AuctionId) -> Result<(), CacheError>;
}
