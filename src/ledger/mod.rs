//! C3: the durable, transactional ledger. Shaped after `AtomicAuctionStore`
//! (trait + swappable backend), grounded the same way on
//! `solana_client::SolanaClient` + `new_with_url`, but the production side is
//! backed by MongoDB's client-session transactions rather than a Lua script,
//! since the ledger's unit of atomicity spans multiple collections.

pub mod memory_store;
pub mod models;
pub mod mongo_store;

use async_trait::async_trait;

use crate::errors::LedgerError;
use crate::model::{Auction, AuctionId, Bid, BidId, Transaction, User, UserId};

/// Result of any balance-mutation primitive: the user's post-mutation state
/// plus the single append-only transaction the mutation produced (§3,
/// "every balance mutation must emit exactly one transaction in the same
/// database transaction").
#[derive(Debug, Clone)]
pub struct MutationResult {
    pub user: User,
    pub transaction: Transaction,
}

/// A round's winner, as computed by the scheduler's leaderboard snapshot
/// (§4.5 step 1) and handed to `complete_round_winners` to be applied
/// atomically.
#[derive(Debug, Clone)]
pub struct RoundWinner {
    pub bid_id: BidId,
    pub user_id: UserId,
    pub amount: i64,
    pub item_number: u32,
}

/// A round's non-winner, refunded and marked `lost` in one ledger
/// transaction per bid (§4.5 step 3).
#[derive(Debug, Clone)]
pub struct RoundLoser {
    pub bid_id: BidId,
    pub user_id: UserId,
    pub amount: i64,
}

/// One user's mismatch against the expected invariant
/// `balance + frozen == Σdeposits − Σwithdraws − Σconfirmed-wins` (§8),
/// surfaced by `audit_financial_integrity` instead of collapsing the whole
/// report into a boolean.
#[derive(Debug, Clone)]
pub struct IntegrityMismatch {
    pub user_id: UserId,
    pub recorded_total: i64,
    pub expected_total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub users_checked: usize,
    pub mismatches: Vec<IntegrityMismatch>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, LedgerError>;

    /// Inserts a fresh user with zero balances if one does not already
    /// exist, returning the current record either way (§3: "created on
    /// first authenticated login").
    async fn ensure_user(&self, user_id: &UserId, display_name: &str) -> Result<User, LedgerError>;

    async fn deposit(&self, user_id: &UserId, delta: i64) -> Result<MutationResult, LedgerError>;

    async fn withdraw(&self, user_id: &UserId, delta: i64) -> Result<MutationResult, LedgerError>;

    async fn freeze(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError>;

    async fn unfreeze(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError>;

    async fn confirm_win(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError>;

    async fn refund(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError>;

    async fn get_auction(&self, auction_id: &AuctionId) -> Result<Option<Auction>, LedgerError>;

    async fn insert_auction(&self, auction: &Auction) -> Result<(), LedgerError>;

    /// Replaces the whole auction document. The scheduler is the sole writer
    /// of an auction's lifecycle fields per §4.8, so this is a plain upsert,
    /// not a CAS — unlike `User`, `Auction` has no `version` field in the
    /// data model (§3).
    async fn save_auction(&self, auction: &Auction) -> Result<(), LedgerError>;

    async fn list_active_auctions(&self) -> Result<Vec<Auction>, LedgerError>;

    async fn get_active_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<Bid>, LedgerError>;

    /// Bids by `(auctionId, status=active)`, sorted by amount desc then
    /// createdAt asc (§4.3 index requirement; also the round-completion
    /// leaderboard order).
    async fn list_active_bids(&self, auction_id: &AuctionId) -> Result<Vec<Bid>, LedgerError>;

    async fn list_bids_by_user(&self, user_id: &UserId) -> Result<Vec<Bid>, LedgerError>;

    /// Every bid ever placed against an auction, any status, newest first.
    /// Used by `getLeaderboard`'s past-winner list (§6), which needs winners
    /// of already-completed rounds, not only the current round's active set.
    async fn list_bids_by_auction(&self, auction_id: &AuctionId) -> Result<Vec<Bid>, LedgerError>;

    /// Inserts a new active bid or increases an existing one's `amount` in
    /// place (§3 Bid lifecycle). Does not touch balances; callers run
    /// `freeze`/`unfreeze` separately when this is used outside the hot-path
    /// (the slow `placeBid` path, §6).
    async fn upsert_active_bid(&self, bid: &Bid) -> Result<(), LedgerError>;

    /// Marks each winner's bid `won` with its `itemNumber` and calls
    /// `confirm_win` for its amount, each winner in its own ledger
    /// transaction (§4.5 step 2). Returns the winners that were applied;
    /// a winner missing from the result failed with `Conflict` and the
    /// scheduler's retry-with-backoff will pick it up on the next pass.
    async fn complete_round_winners(
        &self,
        auction_id: &AuctionId,
        round_number: u32,
        winners: &[RoundWinner],
    ) -> Result<Vec<BidId>, LedgerError>;

    /// Marks each loser's bid `lost` and refunds its frozen amount (§4.5
    /// step 3). Returns the bid ids that were applied.
    async fn complete_round_losers(
        &self,
        auction_id: &AuctionId,
        round_number: u32,
        losers: &[RoundLoser],
    ) -> Result<Vec<BidId>, LedgerError>;

    /// Refunds every still-frozen bid of a cancelled auction, marking each
    /// `cancelled` (§4.5 "Cancellation").
    async fn cancel_auction_refunds(
        &self,
        auction_id: &AuctionId,
        frozen_bids: &[RoundLoser],
    ) -> Result<Vec<BidId>, LedgerError>;

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn audit_financial_integrity(&self) -> Result<IntegrityReport, LedgerError>;
}
