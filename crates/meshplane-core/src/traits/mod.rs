//! Core traits for the control plane
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Persister`]: Domain-scoped record storage
//! - [`Provider`]: Local or remote provider contract
//! - [`RemoteAuthority`]: External identity/preference authority
//! - [`BrokerConnection`]: Publish/subscribe transport
//! - [`JobHandler`]: Task queue background job

pub mod authority;
pub mod broker;
pub mod job_handler;
pub mod persister;
pub mod provider;

pub use authority::{AuthorityFactory, PreferenceSet, RemoteAuthority};
pub use broker::{
    BrokerConnection, BrokerMessage, ClusterSignal, EventType, MessageStream, SignalStream,
};
pub use job_handler::{Job, JobHandler, SUBMIT_METRICS_JOB};
pub use persister::{Backend, Domain, Persister};
pub use provider::{Capabilities, Provider, ProviderKind};
