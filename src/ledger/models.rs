//! BSON document shapes for the Mongo backend. Kept separate from
//! `crate::model` because the ledger's on-disk representation carries a
//! Mongo `_id` and camelCase field names the wire/domain types don't need.

use serde::{Deserialize, Serialize};

use crate::model::{Auction, AuctionStatus, Bid, BidStatus, RoundSpec, RoundState, Transaction, TransactionType, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub display_name: String,
    pub external_identity: Option<String>,
    pub language: String,
    pub balance: i64,
    pub frozen_balance: i64,
    pub is_bot: bool,
    pub version: i64,
}

impl From<UserDoc> for User {
    fn from(doc: UserDoc) -> Self {
        User {
            id: doc.id,
            display_name: doc.display_name,
            external_identity: doc.external_identity,
            language: doc.language,
            balance: doc.balance,
            frozen_balance: doc.frozen_balance,
            is_bot: doc.is_bot,
            version: doc.version as u64,
        }
    }
}

impl From<&User> for UserDoc {
    fn from(user: &User) -> Self {
        UserDoc {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            external_identity: user.external_identity.clone(),
            language: user.language.clone(),
            balance: user.balance,
            frozen_balance: user.frozen_balance,
            is_bot: user.is_bot,
            version: user.version as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub owner: String,
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
    pub current_round: u32,
    pub rounds: Vec<RoundState>,
}

impl From<AuctionDoc> for Auction {
    fn from(doc: AuctionDoc) -> Self {
        Auction {
            id: doc.id,
            title: doc.title,
            owner: doc.owner,
            total_items: doc.total_items,
            round_specs: doc.round_specs,
            min_bid_amount: doc.min_bid_amount,
            min_bid_increment: doc.min_bid_increment,
            anti_sniping_window_ms: doc.anti_sniping_window_ms,
            anti_sniping_extension_ms: doc.anti_sniping_extension_ms,
            max_extensions: doc.max_extensions,
            bots_enabled: doc.bots_enabled,
            bot_count: doc.bot_count,
            status: doc.status,
            current_round: doc.current_round,
            rounds: doc.rounds,
        }
    }
}

impl From<&Auction> for AuctionDoc {
    fn from(a: &Auction) -> Self {
        AuctionDoc {
            id: a.id.clone(),
            title: a.title.clone(),
            owner: a.owner.clone(),
            total_items: a.total_items,
            round_specs: a.round_specs.clone(),
            min_bid_amount: a.min_bid_amount,
            min_bid_increment: a.min_bid_increment,
            anti_sniping_window_ms: a.anti_sniping_window_ms,
            anti_sniping_extension_ms: a.anti_sniping_extension_ms,
            max_extensions: a.max_extensions,
            bots_enabled: a.bots_enabled,
            bot_count: a.bot_count,
            status: a.status,
            current_round: a.current_round,
            rounds: a.rounds.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub auction_id: String,
    pub user_id: String,
    pub amount: i64,
    pub status: BidStatus,
    pub won_round: Option<u32>,
    pub item_number: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<BidDoc> for Bid {
    fn from(doc: BidDoc) -> Self {
        Bid {
            id: doc.id,
            auction_id: doc.auction_id,
            user_id: doc.user_id,
            amount: doc.amount,
            status: doc.status,
            won_round: doc.won_round,
            item_number: doc.item_number,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

impl From<&Bid> for BidDoc {
    fn from(b: &Bid) -> Self {
        BidDoc {
            id: b.id.clone(),
            auction_id: b.auction_id.clone(),
            user_id: b.user_id.clone(),
            amount: b.amount,
            status: b.status,
            won_round: b.won_round,
            item_number: b.item_number,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub frozen_before: i64,
    pub frozen_after: i64,
    pub auction_id: Option<String>,
    pub bid_id: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
}

impl From<TransactionDoc> for Transaction {
    fn from(doc: TransactionDoc) -> Self {
        Transaction {
            id: doc.id,
            user_id: doc.user_id,
            kind: doc.kind,
            amount: doc.amount,
            balance_before: doc.balance_before,
            balance_after: doc.balance_after,
            frozen_before: doc.frozen_before,
            frozen_after: doc.frozen_after,
            auction_id: doc.auction_id,
            bid_id: doc.bid_id,
            description: doc.description,
            created_at: doc.created_at,
        }
    }
}

impl From<&Transaction> for TransactionDoc {
    fn from(t: &Transaction) -> Self {
        TransactionDoc {
            id: t.id.clone(),
            user_id: t.user_id.clone(),
            kind: t.kind,
            amount: t.amount,
            balance_before: t.balance_before,
            balance_after: t.balance_after,
            frozen_before: t.frozen_before,
            frozen_after: t.frozen_after,
            auction_id: t.auction_id.clone(),
            bid_id: t.bid_id.clone(),
            description: t.description.clone(),
            created_at: t.created_at,
        }
    }
}
