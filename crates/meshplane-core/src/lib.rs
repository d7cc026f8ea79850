// # meshplane-core
//
// Control-plane core for a service-mesh management server.
//
// ## Architecture Overview
//
// - **Provider**: Local (self-contained) or Remote (delegates identity and
//   preferences to an authority) entry point for a user's session
// - **PersisterSet**: One persistence handle per data domain, opened at
//   startup and closed once at shutdown
// - **ChannelBridge**: Three named channels with a stop/drain handshake
// - **BrokerBridge**: Tasks moving broker traffic through the channels and
//   into storage
// - **TaskQueue**: In-process FIFO for background jobs
// - **ControlPlane**: Startup wiring and ordered teardown
//
// ## Design Principles
//
// 1. **Library-First**: The daemon is a thin shell over this crate
// 2. **Trait Seams**: Authorities, brokers and job handlers are injected
// 3. **Ordered Teardown**: Sync loops, channels, queue, then storage

pub mod broker;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler_config;
pub mod persister;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod traits;

// Re-export core types for convenience
pub use broker::{BrokerBridge, IngestEvent, Ingestor, MemoryBroker, ObjectKind};
pub use channels::{ChannelBridge, ChannelName, GenericChannel, NamedChannel};
pub use config::{BrokerConfig, QueueConfig, ServerConfig, SessionConfig, SyncConfig};
pub use engine::{Collaborators, ControlPlane};
pub use error::{Error, Result};
pub use handler_config::HandlerConfig;
pub use persister::PersisterSet;
pub use provider::{LocalProvider, RemoteProvider, SyncState};
pub use queue::TaskQueue;
pub use registry::ProviderRegistry;
pub use traits::{
    AuthorityFactory, BrokerConnection, Domain, Job, JobHandler, Persister, Provider,
    RemoteAuthority,
};
