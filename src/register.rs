//! Bundles the configuration plus the shared store handles every actor
//! needs, grounded on `data_loader::register::Register`. Unlike the
//! teacher's one-liner, this `Register` also owns the `Coordinator` (C8)
//! since primary-only status gates which actors a given worker spawns.

use std::sync::Arc;

use crate::cache::AtomicAuctionStore;
use crate::configuration::Configuration;
use crate::coordinator::Coordinator;
use crate::events::EventBus;
use crate::ledger::LedgerStore;

pub struct Register {
    pub config: Configuration,
    pub cache: Arc<dyn AtomicAuctionStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub coordinator: Arc<Coordinator>,
    pub event_bus: Arc<dyn EventBus>,
}

impl Register {
    pub fn new(
        config: Configuration,
        cache: Arc<dyn AtomicAuctionStore>,
        ledger: Arc<dyn LedgerStore>,
        coordinator: Arc<Coordinator>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            cache,
            ledger,
            coordinator,
            event_bus,
        }
    }
}
