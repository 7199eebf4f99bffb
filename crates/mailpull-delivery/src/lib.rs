//! Mailpull Delivery — the polling/delivery loop.
//!
//! This crate provides:
//! - **deliver**: the `Deliver` callback trait
//! - **round**: `RoundExecutor` — one list → fetch → deliver → relocate cycle
//! - **scheduler**: `PollingScheduler` — rounds forever with short/long backoff

pub mod deliver;
pub mod round;
pub mod scheduler;

pub use deliver::Deliver;
pub use round::{deliver_once, RoundExecutor, RoundResult};
pub use scheduler::{PollingScheduler, ShutdownHandle, SleepPolicy};
