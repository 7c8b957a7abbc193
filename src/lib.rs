//! `auction_engine`: the bid-admission and financial-freeze engine plus the
//! real-time coordination plane described in the design doc's components
//! C1-C8. HTTP controllers, identity, and push notifications are deliberately
//! left to callers; this crate exposes only the collaborators they need.

pub mod actors;
pub mod cache;
pub mod configuration;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod ledger;
#[macro_use]
pub mod macros;
pub mod metrics;
pub mod model;
pub mod register;
pub mod service;
