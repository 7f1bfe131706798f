//! Health Aggregation
//!
//! - Static per-component freshness contracts
//! - The pure aggregator producing the system snapshot
//! - Store-backed reader and the heartbeat publisher used by workers

pub mod aggregator;
pub mod contracts;
pub mod publisher;
pub mod reader;

pub use aggregator::{component_verdict, evaluate};
pub use contracts::{ContractConfig, ContractRegistry, HealthConfig, HealthContract};
pub use publisher::HealthPublisher;
pub use reader::{HealthReader, HealthReport};
