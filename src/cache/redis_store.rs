//! Production `AtomicAuctionStore` backend, grounded on
//! `solana_client::{SolanaRpcClient, new_with_url}`: a thin struct wrapping a
//! managed connection, constructed through a plain async factory function
//! rather than a builder type.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::errors::{BidError, CacheError};
use crate::model::score::{SCORE_AMOUNT_MULTIPLIER, SCORE_TIME_CEILING_MS};
use crate::model::{AuctionId, AuctionStatus, UserId};

use super::{AtomicAuctionStore, BalanceProjection, BidProjection, CacheMeta, PlaceBidOutcome};

const PLACE_BID_SCRIPT: &str = include_str!("scripts/place_bid.lua");

fn meta_key(auction_id: &AuctionId) -> String {
    format!("auction:{auction_id}:meta")
}

fn balance_key(auction_id: &AuctionId, user_id: &UserId) -> String {
    format!("auction:{auction_id}:balance:{user_id}")
}

fn bid_key(auction_id: &AuctionId, user_id: &UserId) -> String {
    format!("auction:{auction_id}:bid:{user_id}")
}

fn leaderboard_key(auction_id: &AuctionId) -> String {
    format!("leaderboard:{auction_id}")
}

fn dirty_users_key(auction_id: &AuctionId) -> String {
    format!("auction:{auction_id}:dirty-users")
}

fn known_users_key(auction_id: &AuctionId) -> String {
    format!("auction:{auction_id}:known-users")
}

fn status_str(status: AuctionStatus) -> &'static str {
    match status {
        AuctionStatus::Pending => "Pending",
        AuctionStatus::Active => "Active",
        AuctionStatus::Completed => "Completed",
        AuctionStatus::Cancelled => "Cancelled",
    }
}

fn status_from_str(s: &str) -> AuctionStatus {
    match s {
        "Active" => AuctionStatus::Active,
        "Completed" => AuctionStatus::Completed,
        "Cancelled" => AuctionStatus::Cancelled,
        _ => AuctionStatus::Pending,
    }
}

fn bid_error_from_tag(tag: &str) -> BidError {
    match tag {
        "NotWarmed" => BidError::NotWarmed,
        "NotActive" => BidError::NotActive,
        "RoundEnded" => BidError::RoundEnded,
        "MinBid" => BidError::MinBid,
        "BidTooLow" => BidError::BidTooLow,
        _ => BidError::InsufficientBalance,
    }
}

pub struct RedisStore {
    script: Script,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn new_with_url(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(RedisStore {
            script: Script::new(PLACE_BID_SCRIPT),
            conn,
        })
    }
}

#[async_trait]
impl AtomicAuctionStore for RedisStore {
    async fn warm_up(
        &self,
        auction_id: &AuctionId,
        meta: CacheMeta,
        balances: Vec<(UserId, BalanceProjection)>,
        bids: Vec<(UserId, BidProjection)>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = meta_key(auction_id);

        let existing_version: Option<u64> = conn.hget(&key, "warmVersion").await?;
        if let Some(existing) = existing_version {
            if existing >= meta.warm_version {
                return Ok(());
            }
        }

        // Warming up replaces the whole balance/bid/leaderboard projection
        // (§3: these are auction-scoped, not per-round), so any user left
        // over from a prior warm that isn't part of this one is stale and
        // must be dropped along with the old leaderboard entries.
        let known_key = known_users_key(auction_id);
        let previous_users: Vec<UserId> = conn.smembers(&known_key).await?;
        let leaderboard_key = leaderboard_key(auction_id);

        let mut pipe = redis::pipe();
        pipe.del(&leaderboard_key).ignore();
        for user_id in &previous_users {
            pipe.del(balance_key(auction_id, user_id)).ignore();
            pipe.del(bid_key(auction_id, user_id)).ignore();
        }
        pipe.del(&known_key).ignore();
        pipe.hset(
            &key,
            "minBidAmount",
            meta.min_bid_amount,
        )
        .ignore();
        pipe.hset(&key, "minBidIncrement", meta.min_bid_increment).ignore();
        pipe.hset(&key, "status", status_str(meta.status)).ignore();
        pipe.hset(&key, "currentRound", meta.current_round).ignore();
        pipe.hset(&key, "roundEndTime", meta.round_end_time).ignore();
        pipe.hset(&key, "itemsInRound", meta.items_in_round).ignore();
        pipe.hset(&key, "antiSnipingWindowMs", meta.anti_sniping_window_ms)
            .ignore();
        pipe.hset(&key, "antiSnipingExtensionMs", meta.anti_sniping_extension_ms)
            .ignore();
        pipe.hset(&key, "maxExtensions", meta.max_extensions).ignore();
        pipe.hset(&key, "extensionsCount", meta.extensions_count).ignore();
        pipe.hset(&key, "warmVersion", meta.warm_version).ignore();

        for (user_id, balance) in &balances {
            pipe.hset(balance_key(auction_id, user_id), "available", balance.available)
                .ignore();
            pipe.hset(balance_key(auction_id, user_id), "frozen", balance.frozen)
                .ignore();
        }

        for (user_id, bid) in &bids {
            pipe.hset(bid_key(auction_id, user_id), "amount", bid.amount).ignore();
            pipe.hset(bid_key(auction_id, user_id), "createdAt", bid.created_at)
                .ignore();
            pipe.hset(bid_key(auction_id, user_id), "version", bid.version)
                .ignore();
            let score = bid.amount * SCORE_AMOUNT_MULTIPLIER + (SCORE_TIME_CEILING_MS - bid.created_at);
            pipe.zadd(&leaderboard_key, user_id, score).ignore();
        }

        let known_users: std::collections::HashSet<&UserId> =
            balances.iter().map(|(u, _)| u).chain(bids.iter().map(|(u, _)| u)).collect();
        if !known_users.is_empty() {
            pipe.sadd(&known_key, known_users.into_iter().collect::<Vec<_>>()).ignore();
        }

        pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_meta(&self, auction_id: &AuctionId) -> Result<Option<CacheMeta>, CacheError> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, String)> = conn.hgetall(meta_key(auction_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let map: std::collections::HashMap<String, String> = fields.into_iter().collect();
        let get = |k: &str| -> Result<i64, CacheError> {
            map.get(k)
                .ok_or_else(|| CacheError::Malformed(format!("missing field {k}")))?
                .parse()
                .map_err(|_| CacheError::Malformed(format!("field {k} is not an integer")))
        };
        Ok(Some(CacheMeta {
            min_bid_amount: get("minBidAmount")?,
            min_bid_increment: get("minBidIncrement")?,
            status: status_from_str(map.get("status").map(String::as_str).unwrap_or("Pending")),
            current_round: get("currentRound")? as u32,
            round_end_time: get("roundEndTime")?,
            items_in_round: get("itemsInRound")? as u32,
            anti_sniping_window_ms: get("antiSnipingWindowMs")?,
            anti_sniping_extension_ms: get("antiSnipingExtensionMs")?,
            max_extensions: get("maxExtensions")? as u32,
            extensions_count: get("extensionsCount")? as u32,
            warm_version: get("warmVersion")? as u64,
        }))
    }

    async fn get_balance(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BalanceProjection>, CacheError> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, i64)> = conn.hgetall(balance_key(auction_id, user_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let map: std::collections::HashMap<String, i64> = fields.into_iter().collect();
        Ok(Some(BalanceProjection {
            available: *map.get("available").unwrap_or(&0),
            frozen: *map.get("frozen").unwrap_or(&0),
        }))
    }

    async fn get_bid(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Result<Option<BidProjection>, CacheError> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, i64)> = conn.hgetall(bid_key(auction_id, user_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let map: std::collections::HashMap<String, i64> = fields.into_iter().collect();
        Ok(Some(BidProjection {
            amount: *map.get("amount").unwrap_or(&0),
            created_at: *map.get("createdAt").unwrap_or(&0),
            version: *map.get("version").unwrap_or(&0) as u64,
        }))
    }

    async fn place_bid_fast(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
        amount: i64,
        now_ms: i64,
    ) -> Result<PlaceBidOutcome, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = self
            .script
            .key(meta_key(auction_id))
            .key(balance_key(auction_id, user_id))
            .key(bid_key(auction_id, user_id))
            .key(leaderboard_key(auction_id))
            .key(dirty_users_key(auction_id))
            .arg(user_id)
            .arg(amount)
            .arg(now_ms)
            .arg(SCORE_AMOUNT_MULTIPLIER)
            .arg(SCORE_TIME_CEILING_MS)
            .invoke_async(&mut conn)
            .await?;

        parse_place_bid_reply(reply)
    }

    async fn leaderboard_range(
        &self,
        auction_id: &AuctionId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(UserId, i64)>, CacheError> {
        let mut conn = self.conn.clone();
        let start = offset as isize;
        let stop = (offset + limit).saturating_sub(1) as isize;
        let entries: Vec<(String, i64)> = conn
            .zrevrange_withscores(leaderboard_key(auction_id), start, stop)
            .await?;
        Ok(entries)
    }

    async fn dirty_users(&self, auction_id: &AuctionId) -> Result<Vec<UserId>, CacheError> {
        let mut conn = self.conn.clone();
        let users: Vec<UserId> = conn.smembers(dirty_users_key(auction_id)).await?;
        Ok(users)
    }

    async fn clear_dirty(
        &self,
        auction_id: &AuctionId,
        user_ids: &[UserId],
    ) -> Result<(), CacheError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.srem(dirty_users_key(auction_id), user_ids).await?;
        Ok(())
    }

    async fn cas_round_end_time(
        &self,
        auction_id: &AuctionId,
        expected_prev_end_time: i64,
        new_end_time: i64,
        extensions_count: u32,
    ) -> Result<bool, CacheError> {
        let key = meta_key(auction_id);
        let mut conn = self.conn.clone();
        let current: Option<i64> = conn.hget(&key, "roundEndTime").await?;
        if current != Some(expected_prev_end_time) {
            return Ok(false);
        }
        let mut pipe = redis::pipe();
        pipe.hset(&key, "roundEndTime", new_end_time).ignore();
        pipe.hset(&key, "extensionsCount", extensions_count).ignore();
        pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn set_status(
        &self,
        auction_id: &AuctionId,
        status: AuctionStatus,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.hset(meta_key(auction_id), "status", status_str(status))
            .await?;
        Ok(())
    }

    async fn teardown(&self, auction_id: &AuctionId) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let dirty_key = dirty_users_key(auction_id);
        let known_key = known_users_key(auction_id);
        let dirty_users: Vec<String> = conn.smembers(&dirty_key).await?;
        let known_users: Vec<String> = conn.smembers(&known_key).await?;
        let mut keys = vec![
            meta_key(auction_id),
            leaderboard_key(auction_id),
            dirty_key,
            known_key,
        ];
        for user_id in dirty_users.iter().chain(known_users.iter()).collect::<std::collections::HashSet<_>>() {
            keys.push(balance_key(auction_id, user_id));
            keys.push(bid_key(auction_id, user_id));
        }
        conn.del(keys).await?;
        Ok(())
    }
}

fn parse_place_bid_reply(reply: Vec<redis::Value>) -> Result<PlaceBidOutcome, CacheError> {
    let tag = match reply.first() {
        Some(redis::Value::Data(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
        _ => return Err(CacheError::Malformed("empty bid script reply".into())),
    };

    if tag == "err" {
        let discriminant = match reply.get(1) {
            Some(redis::Value::Data(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            _ => return Err(CacheError::Malformed("missing error discriminant".into())),
        };
        return Err(CacheError::Bid(bid_error_from_tag(&discriminant)));
    }

    fn as_i64(v: &redis::Value) -> Result<i64, CacheError> {
        match v {
            redis::Value::Int(n) => Ok(*n),
            redis::Value::Data(bytes) => String::from_utf8_lossy(bytes)
                .parse()
                .map_err(|_| CacheError::Malformed("non-integer field in bid script reply".into())),
            _ => Err(CacheError::Malformed("unexpected field type in bid script reply".into())),
        }
    }

    if reply.len() < 11 {
        return Err(CacheError::Malformed("short bid script reply".into()));
    }

    Ok(PlaceBidOutcome {
        new_amount: as_i64(&reply[1])?,
        previous_amount: as_i64(&reply[2])?,
        frozen_delta: as_i64(&reply[3])?,
        is_new_bid: as_i64(&reply[4])? != 0,
        round_end_time: as_i64(&reply[5])?,
        anti_sniping_window_ms: as_i64(&reply[6])?,
        anti_sniping_extension_ms: as_i64(&reply[7])?,
        max_extensions: as_i64(&reply[8])? as u32,
        items_in_round: as_i64(&reply[9])? as u32,
        current_round: as_i64(&reply[10])? as u32,
    })
}
