pub mod score;

use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type AuctionId = String;
pub type BidId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidStatus {
    Active,
    Won,
    Lost,
    Refunded,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Deposit,
    Withdraw,
    BidFreeze,
    BidUnfreeze,
    BidWin,
    BidRefund,
}

/// Configured shape of a single round, set at auction creation and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSpec {
    pub items_count: u32,
    pub duration_minutes: u32,
}

/// Mutable runtime state of a single round, parallel-indexed with
/// `Auction::rounds`. Rounds never hold a back-reference to their bids;
/// bids are looked up by `(auctionId, roundNumber)` and a completed round
/// records only the ids it produced (see the Design Notes' "arena of ids"
/// rewrite of the source's cyclic round/bid references).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundState {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub items_count: u32,
    pub extensions_count: u32,
    pub completed: bool,
    pub winner_bid_ids: Vec<BidId>,
}

impl RoundState {
    pub fn pending(items_count: u32) -> Self {
        RoundState {
            start_time: None,
            end_time: None,
            items_count,
            extensions_count: 0,
            completed: false,
            winner_bid_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub title: String,
    pub owner: UserId,
    pub total_items: u32,
    pub round_specs: Vec<RoundSpec>,
    pub min_bid_amount: i64,
    pub min_bid_increment: i64,
    pub anti_sniping_window_ms: i64,
    pub anti_sniping_extension_ms: i64,
    pub max_extensions: u32,
    pub bots_enabled: bool,
    pub bot_count: u32,
    pub status: AuctionStatus,
    /// 1-indexed; 0 while pending.
    pub current_round: u32,
    pub rounds: Vec<RoundState>,
}

impl Auction {
    /// Validates `Σ itemsCount == totalItems` and all-positive items/duration,
    /// per the Auction invariants in §3.
    pub fn validate(&self) -> Result<(), String> {
        if self.round_specs.is_empty() {
            return Err("auction must have at least one round".into());
        }
        let sum: u32 = self.round_specs.iter().map(|r| r.items_count).sum();
        if sum != self.total_items {
            return Err(format!(
                "round items sum to {} but totalItems is {}",
                sum, self.total_items
            ));
        }
        if self
            .round_specs
            .iter()
            .any(|r| r.items_count == 0 || r.duration_minutes == 0)
        {
            return Err("round itemsCount and durationMinutes must be positive".into());
        }
        Ok(())
    }

    pub fn current_round_state(&self) -> Option<&RoundState> {
        if self.current_round == 0 {
            return None;
        }
        self.rounds.get(self.current_round as usize - 1)
    }

    pub fn current_round_spec(&self) -> Option<&RoundSpec> {
        if self.current_round == 0 {
            return None;
        }
        self.round_specs.get(self.current_round as usize - 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: i64,
    pub status: BidStatus,
    pub won_round: Option<u32>,
    pub item_number: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: UserId,
    pub kind: TransactionType,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub frozen_before: i64,
    pub frozen_after: i64,
    pub auction_id: Option<AuctionId>,
    pub bid_id: Option<BidId>,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub external_identity: Option<String>,
    pub language: String,
    pub balance: i64,
    pub frozen_balance: i64,
    pub is_bot: bool,
    pub version: u64,
}

impl User {
    pub fn total(&self) -> i64 {
        self.balance + self.frozen_balance
    }
}

/// Rewrite of the source's runtime-dispatch "polymorphic populate", where a
/// bid's `auctionId` field was either a bare id or an already-joined summary
/// depending on the query. Call sites that need a summary ask for one
/// explicitly via `AuctionRef::Summary`; nothing is inferred from shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuctionRef {
    Id(AuctionId),
    Summary(AuctionSummary),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSummary {
    pub id: AuctionId,
    pub title: String,
    pub status: AuctionStatus,
    pub current_round: u32,
}

impl AuctionRef {
    pub fn id(&self) -> &str {
        match self {
            AuctionRef::Id(id) => id,
            AuctionRef::Summary(s) => &s.id,
        }
    }
}
