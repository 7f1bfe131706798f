//! Persistence Layer
//!
//! Everything that crosses a process boundary goes through the
//! [`DurableStore`]: health records, breaker and control-plane state, locks,
//! and the append-only audit and command logs.

pub mod keys;
pub mod store;

pub use store::{DurableStore, StoreConfig};
