//! Metric statics, grounded directly on
//! `data_analyzer::actors::prometheus_exporter`'s `lazy_static! { ... }`
//! block: one custom `Registry`, metrics registered against it by name.
//! `actors::prometheus_exporter` serves this registry over HTTP; everywhere
//! else touches it only through `metrics_update!`.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec_with_registry, register_gauge_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Gauge, GaugeVec, Histogram, IntCounter, IntCounterVec,
    Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry =
        Registry::new_custom(Some("auction_engine".to_string()), None).unwrap();
    pub static ref BIDS_ADMITTED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "bids_admitted_total",
        "Number of bids accepted by the atomic bid script",
        REGISTRY
    )
    .unwrap();
    pub static ref BIDS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "bids_rejected_total",
        "Number of bids rejected by the atomic bid script, by reason",
        &["reason"],
        REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_CONNECTIONS: Gauge = register_gauge_with_registry!(
        "active_connections",
        "Number of currently open socket connections",
        REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_ROOMS: Gauge = register_gauge_with_registry!(
        "active_rooms",
        "Number of auction rooms with at least one subscriber",
        REGISTRY
    )
    .unwrap();
    pub static ref ROUND_EXTENSIONS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "round_extensions_total",
        "Number of anti-sniping round extensions applied",
        REGISTRY
    )
    .unwrap();
    pub static ref SYNC_DRAIN_LAG_SECONDS: GaugeVec = register_gauge_vec_with_registry!(
        "sync_drain_lag_seconds",
        "Seconds since the sync worker last drained an auction's dirty set",
        &["auction_id"],
        REGISTRY
    )
    .unwrap();
    pub static ref SYNC_DIRTY_USERS_PENDING: GaugeVec = register_gauge_vec_with_registry!(
        "sync_dirty_users_pending",
        "Dirty users waiting to be drained into the ledger, by auction",
        &["auction_id"],
        REGISTRY
    )
    .unwrap();
    pub static ref BID_ADMISSION_SECONDS: Histogram = register_histogram_with_registry!(
        "bid_admission_seconds",
        "Time spent executing the atomic bid admission script",
        REGISTRY
    )
    .unwrap();
    pub static ref PRIMARY_LEASE_HELD: Gauge = register_gauge_with_registry!(
        "primary_lease_held",
        "1 if this worker currently holds the primary coordination lease, else 0",
        REGISTRY
    )
    .unwrap();
}
