//! The engine's four background actors, one module each, mirroring the
//! teacher's `actors/` layout (`data_loader::actors`, `data_analyzer::actors`):
//! every actor exposes a `FooCtx::setup_and_run(&register)` constructor that
//! spawns its background task(s) and returns a cheap `Clone`able handle,
//! never a type callers hold a lock on.

pub mod prometheus_exporter;
pub mod scheduler;
pub mod socket_layer;
pub mod sync_worker;
