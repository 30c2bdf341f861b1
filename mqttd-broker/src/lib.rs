//! Turnkey multi-tenant MQTT 3.1/3.1.1 broker.
//!
//! The broker keeps one system context for listeners and connections
//! that have not completed CONNECT, and re-parents every accepted
//! session onto the context of the tenant domain it resolves to. Domains
//! are isolated from one another: subscriptions, client ids, retained
//! messages and session storage never cross tenants.

mod broker;
mod domain;

pub use crate::broker::{Broker, BrokerBuilder};
pub use crate::domain::{Domain, DomainDef, DomainSettings};

pub use mqttd_proto::{
    AuthBackend, MemoryAuth, PublishDecision, Settings, StaticSettings, StorageLimits,
};
