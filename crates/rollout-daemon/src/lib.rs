//! Update-reconciliation control loop.
//!
//! This crate hosts the daemon side of the updater: the per-wake
//! orchestrator cycle, candidate qualification, self-management of the
//! updater's own versions, payload fetching, the server client, and
//! the legacy compatibility shim. Persistent state and the shared data
//! model live in `rollout-core`; everything here operates through the
//! traits that crate exports, so tests substitute in-memory stores and
//! scripted network doubles.
//!
//! # Modules
//!
//! - [`orchestrator`]: the wake cycle state machine
//! - [`qualification`]: candidate self-test before promotion
//! - [`self_manage`]: qualify/activate/hand-off decisions for the
//!   updater's own versions
//! - [`fetch`]: payload download with per-hash single-flight caching
//! - [`client`]: update-check and ping exchanges with the server
//! - [`legacy`]: synchronous shim for the legacy control surface
//! - [`testing`]: scripted doubles used by this crate's tests and by
//!   downstream integration tests

pub mod client;
pub mod clock;
pub mod errors;
pub mod fetch;
pub mod legacy;
pub mod orchestrator;
pub mod qualification;
pub mod self_manage;
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use errors::UpdateError;
pub use orchestrator::{CycleReport, Orchestrator, WakeReason};
