//! rollout-core - domain types and persistent state for the rollout
//! updater.
//!
//! This crate holds everything the control loop in `rollout-daemon`
//! decides *about*: installed updater versions and their lifecycle
//! states, product registrations, effective update policy, the wire
//! protocol types, installer result interpretation, and the persisted
//! instance state. Business logic never touches the platform store or
//! an OS lock primitive directly; it goes through the
//! [`store::PersistentStore`] and [`lock::SetupLock`] capabilities.

pub mod installer;
pub mod lock;
pub mod policy;
pub mod prefs;
pub mod protocol;
pub mod registration;
pub mod store;
pub mod version;
pub mod versions;

pub use lock::{LockError, SetupGuard, SetupLock};
pub use store::{PersistentStore, StoreError};
pub use version::Version;
