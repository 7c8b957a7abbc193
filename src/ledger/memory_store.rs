//! In-process `LedgerStore`: "a versioned in-memory map", as named directly
//! in §4.3. Backs unit tests and the E1-E6 scenario tests without a live
//! MongoDB; also doubles as small single-worker deployments' ledger, the
//! same role `memory_store` plays for the hot cache.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::errors::{LedgerConflict, LedgerError};
use crate::model::{Auction, AuctionId, Bid, BidId, BidStatus, Transaction, TransactionType, User, UserId};

use super::{IntegrityMismatch, IntegrityReport, LedgerStore, MutationResult, RoundLoser, RoundWinner};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Default)]
struct Ledgers {
    users: HashMap<UserId, User>,
    auctions: HashMap<AuctionId, Auction>,
    /// Keyed by bid id; active bids are also reachable by `(auctionId,
    /// userId)` via a linear scan, acceptable at in-memory test scale.
    bids: HashMap<BidId, Bid>,
    transactions: Vec<Transaction>,
}

pub struct MemoryLedgerStore {
    inner: Mutex<Ledgers>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        MemoryLedgerStore {
            inner: Mutex::new(Ledgers::default()),
        }
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Op {
    Deposit,
    Withdraw,
    Freeze,
    Unfreeze,
    ConfirmWin,
    Refund,
}

impl Op {
    fn transaction_kind(&self) -> TransactionType {
        match self {
            Op::Deposit => TransactionType::Deposit,
            Op::Withdraw => TransactionType::Withdraw,
            Op::Freeze => TransactionType::BidFreeze,
            Op::Unfreeze => TransactionType::BidUnfreeze,
            Op::ConfirmWin => TransactionType::BidWin,
            Op::Refund => TransactionType::BidRefund,
        }
    }

    /// Applies the mutation to `(available, frozen)`, returning the new pair
    /// or the conflict it fails with (§4.3's six primitives).
    fn apply(&self, available: i64, frozen: i64, delta: i64) -> Result<(i64, i64), LedgerConflict> {
        match self {
            Op::Deposit => Ok((available + delta, frozen)),
            Op::Withdraw => {
                if available < delta {
                    return Err(LedgerConflict::InsufficientAvailable);
                }
                Ok((available - delta, frozen))
            }
            Op::Freeze => {
                if available < delta {
                    return Err(LedgerConflict::InsufficientAvailable);
                }
                Ok((available - delta, frozen + delta))
            }
            Op::Unfreeze => {
                if frozen < delta {
                    return Err(LedgerConflict::InsufficientFrozen);
                }
                Ok((available + delta, frozen - delta))
            }
            Op::ConfirmWin => {
                if frozen < delta {
                    return Err(LedgerConflict::InsufficientFrozen);
                }
                Ok((available, frozen - delta))
            }
            Op::Refund => {
                if frozen < delta {
                    return Err(LedgerConflict::InsufficientFrozen);
                }
                Ok((available + delta, frozen - delta))
            }
        }
    }
}

impl Ledgers {
    fn mutate(
        &mut self,
        op: Op,
        user_id: &UserId,
        delta: i64,
        auction_id: Option<&AuctionId>,
        bid_id: Option<&BidId>,
    ) -> Result<MutationResult, LedgerError> {
        let user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(user_id.clone()))?;

        let balance_before = user.balance;
        let frozen_before = user.frozen_balance;
        let (new_available, new_frozen) = op
            .apply(user.balance, user.frozen_balance, delta)
            .map_err(LedgerError::Conflict)?;

        user.balance = new_available;
        user.frozen_balance = new_frozen;
        user.version += 1;
        let user = user.clone();

        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            kind: op.transaction_kind(),
            amount: delta,
            balance_before,
            balance_after: new_available,
            frozen_before,
            frozen_after: new_frozen,
            auction_id: auction_id.cloned(),
            bid_id: bid_id.cloned(),
            description: None,
            created_at: now_ms(),
        };
        self.transactions.push(transaction.clone());

        Ok(MutationResult { user, transaction })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, LedgerError> {
        Ok(self.inner.lock().unwrap().users.get(user_id).cloned())
    }

    async fn ensure_user(&self, user_id: &UserId, display_name: &str) -> Result<User, LedgerError> {
        let mut ledgers = self.inner.lock().unwrap();
        let user = ledgers.users.entry(user_id.clone()).or_insert_with(|| User {
            id: user_id.clone(),
            display_name: display_name.to_string(),
            external_identity: None,
            language: "en".to_string(),
            balance: 0,
            frozen_balance: 0,
            is_bot: false,
            version: 0,
        });
        Ok(user.clone())
    }

    async fn deposit(&self, user_id: &UserId, delta: i64) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::Deposit, user_id, delta, None, None)
    }

    async fn withdraw(&self, user_id: &UserId, delta: i64) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::Withdraw, user_id, delta, None, None)
    }

    async fn freeze(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::Freeze, user_id, delta, Some(auction_id), Some(bid_id))
    }

    async fn unfreeze(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::Unfreeze, user_id, delta, Some(auction_id), Some(bid_id))
    }

    async fn confirm_win(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::ConfirmWin, user_id, delta, Some(auction_id), Some(bid_id))
    }

    async fn refund(
        &self,
        user_id: &UserId,
        delta: i64,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<MutationResult, LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .mutate(Op::Refund, user_id, delta, Some(auction_id), Some(bid_id))
    }

    async fn get_auction(&self, auction_id: &AuctionId) -> Result<Option<Auction>, LedgerError> {
        Ok(self.inner.lock().unwrap().auctions.get(auction_id).cloned())
    }

    async fn insert_auction(&self, auction: &Auction) -> Result<(), LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .auctions
            .insert(auction.id.clone(), auction.clone());
        Ok(())
    }

    async fn save_auction(&self, auction: &Auction) -> Result<(), LedgerError> {
        self.inner
            .lock()
            .unwrap()
            .auctions
            .insert(auction.id.clone(), auction.clone());
        Ok(())
    }

    async fn list_active_auctions(&self) -> Result<Vec<Auction>, LedgerError> {
        use crate::model::AuctionStatus;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .auctions
            .values()
            .filter(|a| a.status == AuctionStatus::Active)
            .cloned()
            .collect())
    }

    async fn get_active_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<Bid>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bids
            .values()
            .find(|b| b.auction_id == *auction_id && b.user_id == *user_id && b.status == BidStatus::Active)
            .cloned())
    }

    async fn list_active_bids(&self, auction_id: &AuctionId) -> Result<Vec<Bid>, LedgerError> {
        let mut bids: Vec<Bid> = self
            .inner
            .lock()
            .unwrap()
            .bids
            .values()
            .filter(|b| b.auction_id == *auction_id && b.status == BidStatus::Active)
            .cloned()
            .collect();
        bids.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.created_at.cmp(&b.created_at)));
        Ok(bids)
    }

    async fn list_bids_by_user(&self, user_id: &UserId) -> Result<Vec<Bid>, LedgerError> {
        let mut bids: Vec<Bid> = self
            .inner
            .lock()
            .unwrap()
            .bids
            .values()
            .filter(|b| b.user_id == *user_id)
            .cloned()
            .collect();
        bids.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bids)
    }

    async fn list_bids_by_auction(&self, auction_id: &AuctionId) -> Result<Vec<Bid>, LedgerError> {
        let mut bids: Vec<Bid> = self
            .inner
            .lock()
            .unwrap()
            .bids
            .values()
            .filter(|b| b.auction_id == *auction_id)
            .cloned()
            .collect();
        bids.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bids)
    }

    async fn upsert_active_bid(&self, bid: &Bid) -> Result<(), LedgerError> {
        self.inner.lock().unwrap().bids.insert(bid.id.clone(), bid.clone());
        Ok(())
    }

    async fn complete_round_winners(
        &self,
        auction_id: &AuctionId,
        round_number: u32,
        winners: &[RoundWinner],
    ) -> Result<Vec<BidId>, LedgerError> {
        let mut applied = Vec::new();
        for winner in winners {
            let mut ledgers = self.inner.lock().unwrap();
            let result = ledgers.mutate(
                Op::ConfirmWin,
                &winner.user_id,
                winner.amount,
                Some(auction_id),
                Some(&winner.bid_id),
            );
            match result {
                Ok(_) => {
                    if let Some(bid) = ledgers.bids.get_mut(&winner.bid_id) {
                        bid.status = BidStatus::Won;
                        bid.won_round = Some(round_number);
                        bid.item_number = Some(winner.item_number);
                        bid.updated_at = now_ms();
                    }
                    applied.push(winner.bid_id.clone());
                }
                Err(LedgerError::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(applied)
    }

    async fn complete_round_losers(
        &self,
        auction_id: &AuctionId,
        round_number: u32,
        losers: &[RoundLoser],
    ) -> Result<Vec<BidId>, LedgerError> {
        let mut applied = Vec::new();
        for loser in losers {
            let mut ledgers = self.inner.lock().unwrap();
            let result = ledgers.mutate(
                Op::Refund,
                &loser.user_id,
                loser.amount,
                Some(auction_id),
                Some(&loser.bid_id),
            );
            match result {
                Ok(_) => {
                    if let Some(bid) = ledgers.bids.get_mut(&loser.bid_id) {
                        bid.status = BidStatus::Lost;
                        bid.updated_at = now_ms();
                    }
                    let _ = round_number;
                    applied.push(loser.bid_id.clone());
                }
                Err(LedgerError::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(applied)
    }

    async fn cancel_auction_refunds(
        &self,
        auction_id: &AuctionId,
        frozen_bids: &[RoundLoser],
    ) -> Result<Vec<BidId>, LedgerError> {
        let mut applied = Vec::new();
        for bid in frozen_bids {
            let mut ledgers = self.inner.lock().unwrap();
            let result = ledgers.mutate(
                Op::Refund,
                &bid.user_id,
                bid.amount,
                Some(auction_id),
                Some(&bid.bid_id),
            );
            match result {
                Ok(_) => {
                    if let Some(b) = ledgers.bids.get_mut(&bid.bid_id) {
                        b.status = BidStatus::Cancelled;
                        b.updated_at = now_ms();
                    }
                    applied.push(bid.bid_id.clone());
                }
                Err(LedgerError::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(applied)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let ledgers = self.inner.lock().unwrap();
        let mut txns: Vec<Transaction> = ledgers
            .transactions
            .iter()
            .filter(|t| t.user_id == *user_id)
            .cloned()
            .collect();
        txns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txns.into_iter().skip(offset).take(limit).collect())
    }

    async fn audit_financial_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        let ledgers = self.inner.lock().unwrap();
        let mut report = IntegrityReport::default();
        for user in ledgers.users.values() {
            report.users_checked += 1;
            let expected: i64 = ledgers
                .transactions
                .iter()
                .filter(|t| t.user_id == user.id)
                .map(|t| match t.kind {
                    TransactionType::Deposit => t.amount,
                    TransactionType::Withdraw => -t.amount,
                    TransactionType::BidWin => -t.amount,
                    TransactionType::BidFreeze
                    | TransactionType::BidUnfreeze
                    | TransactionType::BidRefund => 0,
                })
                .sum();
            let recorded = user.total();
            if recorded != expected {
                report.mismatches.push(IntegrityMismatch {
                    user_id: user.id.clone(),
                    recorded_total: recorded,
                    expected_total: expected,
                });
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user(user_id: &str, balance: i64) -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        store.ensure_user(&user_id.to_string(), "tester").await.unwrap();
        store.deposit(&user_id.to_string(), balance).await.unwrap();
        store
    }

    #[tokio::test]
    async fn freeze_then_refund_restores_state_e4() {
        let store = store_with_user("u1", 1000).await;
        let uid = "u1".to_string();
        let aid = "a1".to_string();
        let bid = "b1".to_string();

        store.freeze(&uid, 400, &aid, &bid).await.unwrap();
        let after_freeze = store.get_user(&uid).await.unwrap().unwrap();
        assert_eq!((after_freeze.balance, after_freeze.frozen_balance), (600, 400));

        store.refund(&uid, 400, &aid, &bid).await.unwrap();
        let after_refund = store.get_user(&uid).await.unwrap().unwrap();
        assert_eq!((after_refund.balance, after_refund.frozen_balance), (1000, 0));
    }

    #[tokio::test]
    async fn withdraw_more_than_available_conflicts() {
        let store = store_with_user("u1", 100).await;
        let err = store.withdraw(&"u1".to_string(), 200).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Conflict(LedgerConflict::InsufficientAvailable)
        ));
    }

    #[tokio::test]
    async fn confirm_win_removes_money_from_the_system() {
        let store = store_with_user("u1", 1000).await;
        let uid = "u1".to_string();
        let aid = "a1".to_string();
        let bid = "b1".to_string();

        store.freeze(&uid, 500, &aid, &bid).await.unwrap();
        store.confirm_win(&uid, 500, &aid, &bid).await.unwrap();
        let user = store.get_user(&uid).await.unwrap().unwrap();
        assert_eq!((user.balance, user.frozen_balance), (500, 0));
    }

    #[tokio::test]
    async fn audit_reports_no_mismatch_for_clean_ledger() {
        let store = store_with_user("u1", 1000).await;
        let report = store.audit_financial_integrity().await.unwrap();
        assert!(report.is_clean());
    }
}
