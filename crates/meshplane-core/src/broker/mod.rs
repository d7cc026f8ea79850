//! Broker integration
//!
//! - [`MemoryBroker`]: in-process [`BrokerConnection`](crate::traits::BrokerConnection)
//! - [`BrokerBridge`]: tasks moving traffic between the broker and the channel bridge
//! - [`Ingestor`]: applies inbound messages to the persister set

pub mod bridge;
pub mod ingest;
pub mod memory;

pub use bridge::{BridgeHandle, BrokerBridge};
pub use ingest::{IngestEvent, IngestStats, IngestStatsSnapshot, Ingestor, ObjectKind};
pub use memory::MemoryBroker;
