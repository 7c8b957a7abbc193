use thiserror::Error;

/// Distinct tags for every way `placeBidFast` can refuse a bid. Mirrors §7 of
/// the design doc exactly: callers match on the discriminant, not on strings.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BidError {
    #[error("auction cache is not warmed")]
    NotWarmed,

    #[error("auction is not active")]
    NotActive,

    #[error("round has ended")]
    RoundEnded,

    #[error("bid is below the auction minimum")]
    MinBid,

    #[error("bid does not exceed the current bid by the minimum increment")]
    BidTooLow,

    #[error("insufficient available balance")]
    InsufficientBalance,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("bid rejected: {0}")]
    Bid(#[from] BidError),

    #[error("auction {0} not found in hot cache")]
    NotFound(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache payload malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LedgerConflict {
    #[error("user version mismatch, concurrent update detected")]
    VersionMismatch,

    #[error("available balance is insufficient for this mutation")]
    InsufficientAvailable,

    #[error("frozen balance is insufficient for this mutation")]
    InsufficientFrozen,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("conflict: {0}")]
    Conflict(#[from] LedgerConflict),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("bson serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("transaction retry budget exhausted")]
    RetryExhausted,
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("frame exceeds the maximum allowed size")]
    FrameTooLarge,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("auction {0} has no rounds left to start")]
    NoRoundsLeft(String),
}

/// Composes every error domain the §6 façade's operations can surface. Kept
/// distinct from `SchedulerError`: `BidService` is a caller of the scheduler,
/// not the scheduler itself.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("bid rejected: {0}")]
    Bid(#[from] BidError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("not found: {0}")]
    NotFound(String),
}
