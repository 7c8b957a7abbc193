//! C7: Socket Layer. A hyper server that upgrades WebSocket requests via
//! `hyper-tungstenite`, grounded on the teacher's `prometheus_ctx`-style
//! "bind a hyper server in a spawned task" shape but carrying a duplex
//! connection instead of a one-shot metrics response.
//!
//! Each connection gets a reader task (driving the state machine of §4.7)
//! and a writer task (draining an mpsc queue that merges direct responses
//! with room broadcasts from the event bus); the two communicate only
//! through that queue, so there is no shared mutable state per connection
//! besides the room-subscription registry itself.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use jsonwebtoken::{decode, DecodingKey, Validation};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::actors::scheduler::SchedulerHandle;
use crate::cache::AtomicAuctionStore;
use crate::errors::{CacheError, SocketError};
use crate::events::{AuctionEvent, EventBus};
use crate::metrics_update;
use crate::model::AuctionId;
use crate::register::Register;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ClientMessage {
    Auth { token: String },
    JoinAuction { auction_id: String },
    LeaveAuction { auction_id: String },
    PlaceBid { auction_id: serde_json::Value, amount: serde_json::Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ServerMessage {
    AuthResponse {
        success: bool,
        user_id: Option<String>,
        error: Option<String>,
    },
    JoinAuctionResponse {
        success: bool,
    },
    LeaveAuctionResponse {
        success: bool,
    },
    BidResponse {
        success: bool,
        amount: Option<i64>,
        previous_amount: Option<i64>,
        is_new_bid: Option<bool>,
        error: Option<String>,
        needs_warmup: Option<bool>,
    },
}

enum ConnectionState {
    Unauthenticated,
    Authenticated(String),
}

struct SocketContext {
    cache: Arc<dyn AtomicAuctionStore>,
    event_bus: Arc<dyn EventBus>,
    scheduler: SchedulerHandle,
    signing_secret: String,
    max_frame_bytes: usize,
}

pub struct SocketLayerCtx;

impl SocketLayerCtx {
    pub async fn setup_and_run(register: &Register, scheduler: SchedulerHandle) -> Result<()> {
        let ctx = Arc::new(SocketContext {
            cache: register.cache.clone(),
            event_bus: register.event_bus.clone(),
            scheduler,
            signing_secret: register.config.get_auth_config().signing_secret.clone(),
            max_frame_bytes: register.config.get_socket_config().max_frame_bytes,
        });
        let bind_address: SocketAddr = register.config.get_socket_config().bind_address.parse()?;

        tokio::spawn(async move {
            let make_svc = make_service_fn(move |_conn| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, ctx.clone()))) }
            });

            info!("socket layer listening on ws://{bind_address}");
            if let Err(err) = Server::bind(&bind_address).serve(make_svc).await {
                error!("socket layer server error: {err}");
            }
        });

        Ok(())
    }
}

async fn handle_request(
    mut request: Request<Body>,
    ctx: Arc<SocketContext>,
) -> Result<Response<Body>, Infallible> {
    if hyper_tungstenite::is_upgrade_request(&request) {
        match hyper_tungstenite::upgrade(&mut request, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    metrics_update!(inc ACTIVE_CONNECTIONS);
                    match websocket.await {
                        Ok(stream) => {
                            if let Err(err) = serve_connection(stream, ctx.clone()).await {
                                debug!("socket connection ended: {err}");
                            }
                        }
                        Err(err) => warn!("websocket upgrade failed: {err}"),
                    }
                    metrics_update!(dec ACTIVE_CONNECTIONS);
                });
                Ok(response)
            }
            Err(err) => Ok(Response::builder()
                .status(400)
                .body(Body::from(format!("invalid upgrade request: {err}")))
                .unwrap()),
        }
    } else {
        Ok(Response::builder().status(404).body(Body::from("expected a websocket upgrade")).unwrap())
    }
}

async fn serve_connection(
    stream: tokio_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    ctx: Arc<SocketContext>,
) -> Result<(), SocketError> {
    let (mut ws_tx, mut ws_rx) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<AuctionEvent>(256);
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(64);

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = out_rx.recv() => {
                    if let Ok(text) = serde_json::to_string(&event) {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(reply) = reply_rx.recv() => {
                    if let Ok(text) = serde_json::to_string(&reply) {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    });

    let mut state = ConnectionState::Unauthenticated;
    let mut rooms: HashSet<AuctionId> = HashSet::new();
    let mut room_forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(message) = ws_rx.next().await {
        let message = message?;
        match message {
            Message::Text(text) => {
                if text.len() > ctx.max_frame_bytes {
                    let _ = reply_tx
                        .send(ServerMessage::BidResponse {
                            success: false,
                            amount: None,
                            previous_amount: None,
                            is_new_bid: None,
                            error: Some("frame exceeds the maximum allowed size".to_string()),
                            needs_warmup: None,
                        })
                        .await;
                    continue;
                }
                handle_text_message(&text, &ctx, &mut state, &mut rooms, &out_tx, &reply_tx, &mut room_forwarders).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for handle in room_forwarders {
        handle.abort();
    }
    let _ = writer.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_text_message(
    text: &str,
    ctx: &Arc<SocketContext>,
    state: &mut ConnectionState,
    rooms: &mut HashSet<AuctionId>,
    out_tx: &mpsc::Sender<AuctionEvent>,
    reply_tx: &mpsc::Sender<ServerMessage>,
    room_forwarders: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        warn!("dropping malformed socket payload");
        return;
    };

    match msg {
        ClientMessage::Auth { token } => {
            let validation = Validation::default();
            let key = DecodingKey::from_secret(ctx.signing_secret.as_bytes());
            match decode::<Claims>(&token, &key, &validation) {
                Ok(data) => {
                    let user_id = data.claims.sub;
                    *state = ConnectionState::Authenticated(user_id.clone());
                    let _ = reply_tx
                        .send(ServerMessage::AuthResponse { success: true, user_id: Some(user_id), error: None })
                        .await;
                }
                Err(err) => {
                    let _ = reply_tx
                        .send(ServerMessage::AuthResponse { success: false, user_id: None, error: Some(err.to_string()) })
                        .await;
                }
            }
        }
        ClientMessage::JoinAuction { auction_id } => {
            if rooms.insert(auction_id.clone()) {
                spawn_room_forwarder(ctx, &auction_id, out_tx.clone(), room_forwarders);
            }
            let _ = reply_tx.send(ServerMessage::JoinAuctionResponse { success: true }).await;
        }
        ClientMessage::LeaveAuction { auction_id } => {
            rooms.remove(&auction_id);
            let _ = reply_tx.send(ServerMessage::LeaveAuctionResponse { success: true }).await;
        }
        ClientMessage::PlaceBid { auction_id, amount } => {
            let user_id = match state {
                ConnectionState::Authenticated(uid) => uid.clone(),
                ConnectionState::Unauthenticated => {
                    let _ = reply_tx
                        .send(ServerMessage::BidResponse {
                            success: false,
                            amount: None,
                            previous_amount: None,
                            is_new_bid: None,
                            error: Some("not authenticated".to_string()),
                            needs_warmup: None,
                        })
                        .await;
                    return;
                }
            };

            let (Some(auction_id), Some(amount)) = (auction_id.as_str(), amount.as_i64()) else {
                let _ = reply_tx
                    .send(ServerMessage::BidResponse {
                        success: false,
                        amount: None,
                        previous_amount: None,
                        is_new_bid: None,
                        error: Some("Invalid payload".to_string()),
                        needs_warmup: None,
                    })
                    .await;
                return;
            };
            if auction_id.is_empty() || amount <= 0 {
                let _ = reply_tx
                    .send(ServerMessage::BidResponse {
                        success: false,
                        amount: None,
                        previous_amount: None,
                        is_new_bid: None,
                        error: Some("Invalid payload".to_string()),
                        needs_warmup: None,
                    })
                    .await;
                return;
            }
            let auction_id = auction_id.to_string();

            place_bid_over_socket(ctx, &auction_id, &user_id, amount, reply_tx).await;
        }
    }
}

async fn place_bid_over_socket(
    ctx: &Arc<SocketContext>,
    auction_id: &AuctionId,
    user_id: &str,
    amount: i64,
    reply_tx: &mpsc::Sender<ServerMessage>,
) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let timer = metrics_update!(timer BID_ADMISSION_SECONDS);
    let result = ctx
        .cache
        .place_bid_fast(auction_id, &user_id.to_string(), amount, now_ms)
        .await;
    metrics_update!(timer observe timer);

    match result {
        Ok(outcome) => {
            metrics_update!(inc BIDS_ADMITTED_TOTAL);
            let _ = ctx.scheduler.consider_anti_sniping(auction_id, now_ms).await;
            let _ = reply_tx
                .send(ServerMessage::BidResponse {
                    success: true,
                    amount: Some(outcome.new_amount),
                    previous_amount: Some(outcome.previous_amount),
                    is_new_bid: Some(outcome.is_new_bid),
                    error: None,
                    needs_warmup: None,
                })
                .await;
            let _ = ctx
                .event_bus
                .publish(
                    auction_id,
                    AuctionEvent::new_bid(auction_id.clone(), outcome.new_amount, now_ms, !outcome.is_new_bid),
                )
                .await;
        }
        Err(CacheError::Bid(bid_err)) => {
            metrics_update!(inc BIDS_REJECTED_TOTAL, &[bid_err_label(&bid_err)]);
            let needs_warmup = matches!(bid_err, crate::errors::BidError::NotWarmed);
            let _ = reply_tx
                .send(ServerMessage::BidResponse {
                    success: false,
                    amount: None,
                    previous_amount: None,
                    is_new_bid: None,
                    error: Some(bid_err.to_string()),
                    needs_warmup: Some(needs_warmup),
                })
                .await;
        }
        Err(err) => {
            error!("place_bid_fast failed for auction {auction_id}: {err}");
            let _ = reply_tx
                .send(ServerMessage::BidResponse {
                    success: false,
                    amount: None,
                    previous_amount: None,
                    is_new_bid: None,
                    error: Some("internal error".to_string()),
                    needs_warmup: None,
                })
                .await;
        }
    }
}

fn bid_err_label(err: &crate::errors::BidError) -> &'static str {
    use crate::errors::BidError::*;
    match err {
        NotWarmed => "not_warmed",
        NotActive => "not_active",
        RoundEnded => "round_ended",
        MinBid => "min_bid",
        BidTooLow => "bid_too_low",
        InsufficientBalance => "insufficient_balance",
    }
}

/// Bridges the event bus's broadcast receiver for one room into this
/// connection's outbound queue. Aborted when the connection closes.
fn spawn_room_forwarder(
    ctx: &Arc<SocketContext>,
    auction_id: &AuctionId,
    out_tx: mpsc::Sender<AuctionEvent>,
    room_forwarders: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    let event_bus = ctx.event_bus.clone();
    let auction_id = auction_id.clone();
    metrics_update!(inc ACTIVE_ROOMS);
    let handle = tokio::spawn(async move {
        let mut rx = event_bus.subscribe(&auction_id);
        while let Ok(event) = rx.recv().await {
            if out_tx.send(event).await.is_err() {
                break;
            }
        }
        metrics_update!(dec ACTIVE_ROOMS);
    });
    room_forwarders.push(handle);
}
