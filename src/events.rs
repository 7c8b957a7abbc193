//! C6: Event Bus. Publishes the wire events of §4.6 into per-auction rooms
//! and provides the cross-worker delivery adapter described there ("an
//! adapter over C2's pub/sub so that a broadcast from any worker reaches
//! every subscribed socket"). Kept separate from `coordinator`'s
//! `CoordinationChannel`: that one carries operator commands to the primary;
//! this one fans domain events out to every worker's sockets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::AuctionId;

pub(crate) fn iso(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// One winner entry inside `round-complete`, per §4.6's payload table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerSummary {
    pub amount: i64,
    pub item_number: u32,
}

/// One round's wire-shape inside `auction-update`'s `rounds[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_number: u32,
    pub items_count: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub completed: bool,
    pub extensions_count: u32,
}

/// Tagged union of every event §4.6 names. `#[serde(tag = "event")]` gives
/// each variant the `{event, ...payload}` wire shape socket clients expect,
/// the same flattened discriminant style the source's `io.to(room).emit`
/// call sites produce per event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AuctionEvent {
    NewBid {
        auction_id: AuctionId,
        amount: i64,
        timestamp: String,
        is_increase: bool,
    },
    AuctionUpdate {
        id: AuctionId,
        status: String,
        current_round: u32,
        rounds: Vec<RoundSummary>,
    },
    Countdown {
        auction_id: AuctionId,
        round_number: u32,
        time_left_seconds: i64,
        round_end_time: String,
        is_urgent: bool,
        server_time: String,
    },
    AntiSniping {
        auction_id: AuctionId,
        round_number: u32,
        new_end_time: String,
        extension_count: u32,
    },
    RoundStart {
        auction_id: AuctionId,
        round_number: u32,
        items_count: u32,
        start_time: String,
        end_time: String,
    },
    RoundComplete {
        auction_id: AuctionId,
        round_number: u32,
        winners_count: u32,
        winners: Vec<WinnerSummary>,
    },
    AuctionComplete {
        auction_id: AuctionId,
        end_time: String,
        total_rounds: u32,
    },
}

impl AuctionEvent {
    pub fn new_bid(auction_id: AuctionId, amount: i64, timestamp_ms: i64, is_increase: bool) -> Self {
        AuctionEvent::NewBid {
            auction_id,
            amount,
            timestamp: iso(timestamp_ms),
            is_increase,
        }
    }

    pub fn countdown(
        auction_id: AuctionId,
        round_number: u32,
        round_end_time_ms: i64,
        now_ms: i64,
    ) -> Self {
        let time_left_seconds = ((round_end_time_ms - now_ms).max(0)) / 1000;
        AuctionEvent::Countdown {
            auction_id,
            round_number,
            time_left_seconds,
            round_end_time: iso(round_end_time_ms),
            is_urgent: time_left_seconds < 30,
            server_time: iso(now_ms),
        }
    }

    pub fn anti_sniping(auction_id: AuctionId, round_number: u32, new_end_time_ms: i64, extension_count: u32) -> Self {
        AuctionEvent::AntiSniping {
            auction_id,
            round_number,
            new_end_time: iso(new_end_time_ms),
            extension_count,
        }
    }

    pub fn round_start(auction_id: AuctionId, round_number: u32, items_count: u32, start_ms: i64, end_ms: i64) -> Self {
        AuctionEvent::RoundStart {
            auction_id,
            round_number,
            items_count,
            start_time: iso(start_ms),
            end_time: iso(end_ms),
        }
    }

    pub fn round_complete(auction_id: AuctionId, round_number: u32, winners: Vec<WinnerSummary>) -> Self {
        AuctionEvent::RoundComplete {
            auction_id,
            round_number,
            winners_count: winners.len() as u32,
            winners,
        }
    }

    pub fn auction_complete(auction_id: AuctionId, end_ms: i64, total_rounds: u32) -> Self {
        AuctionEvent::AuctionComplete {
            auction_id,
            end_time: iso(end_ms),
            total_rounds,
        }
    }

    /// The room every event of this auction is published into, per §4.6:
    /// "rooms keyed by `auction:<id>`".
    pub fn room(auction_id: &AuctionId) -> String {
        format!("auction:{auction_id}")
    }
}

/// Cross-worker fan-out: publishing here must reach every worker's
/// subscribed sockets regardless of which worker published (§4.6, §5).
/// Delivery is at-most-once; callers must not depend on ordering across
/// auctions.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, auction_id: &AuctionId, event: AuctionEvent) -> anyhow::Result<()>;

    /// Subscribes to one auction's room. Every worker process can call this
    /// regardless of which worker eventually publishes into that room.
    fn subscribe(&self, auction_id: &AuctionId) -> tokio::sync::broadcast::Receiver<AuctionEvent>;
}

/// In-process event bus backed by a broadcast channel per auction room,
/// mirroring `coordinator::LocalCoordinationChannel`'s approach to C2's
/// pub/sub. Production multi-worker deployments replace this with the same
/// trait backed by Redis pub/sub; the socket layer never notices the swap.
#[derive(Default)]
pub struct LocalEventBus {
    rooms: std::sync::Mutex<std::collections::HashMap<String, tokio::sync::broadcast::Sender<AuctionEvent>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, auction_id: &AuctionId) -> tokio::sync::broadcast::Receiver<AuctionEvent> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms
            .entry(AuctionEvent::room(auction_id))
            .or_insert_with(|| tokio::sync::broadcast::channel(1024).0)
            .subscribe()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, auction_id: &AuctionId, event: AuctionEvent) -> anyhow::Result<()> {
        let mut rooms = self.rooms.lock().unwrap();
        let sender = rooms
            .entry(AuctionEvent::room(auction_id))
            .or_insert_with(|| tokio::sync::broadcast::channel(1024).0);
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, auction_id: &AuctionId) -> tokio::sync::broadcast::Receiver<AuctionEvent> {
        LocalEventBus::subscribe(self, auction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_is_urgent_under_30_seconds() {
        let event = AuctionEvent::countdown("a1".to_string(), 1, 10_000, 9_000);
        match event {
            AuctionEvent::Countdown { is_urgent, time_left_seconds, .. } => {
                assert!(is_urgent);
                assert_eq!(time_left_seconds, 1);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_same_room() {
        let bus = LocalEventBus::new();
        let auction_id = "a1".to_string();
        let mut rx = bus.subscribe(&auction_id);
        bus.publish(&auction_id, AuctionEvent::new_bid(auction_id.clone(), 500, 0, false))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AuctionEvent::NewBid { amount: 500, .. }));
    }
}
