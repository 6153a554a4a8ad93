//! Scheduling: deferred account recovery, per-account concurrency slots, and
//! account selection.

pub mod concurrency;
pub mod deferred;
pub mod select;

pub use concurrency::{HolderToken, SlotBroker};
pub use deferred::DeferredScheduler;
pub use select::{AccountScheduler, ScheduleRequest};
