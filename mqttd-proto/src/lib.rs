//! MQTT 3.1/3.1.1 runtime for brokers and clients.
//!
//! The crate wires the wire codec into a threaded runtime: a single
//! reader-loop thread owns the poll set, an elastic worker pool runs the
//! protocol handlers, and a per-connection sequencer serializes outbound
//! writes. A [`Context`] is one complete broker/client instance; tenants
//! of a multi-tenant broker each get their own.

#[macro_use]
extern crate bitflags;

mod auth;
mod conn;
mod context;
mod errors;
mod handler;
mod inflight;
mod message;
mod reader;
mod router;
mod sequencer;
mod settings;
mod storage;
mod topic;
mod transport;
mod workers;

pub use crate::auth::{AuthBackend, MemoryAuth};
pub use crate::conn::{offline_publish, Conn, ConnOptions, Role, Will};
pub use crate::context::{BindOutcome, Context, ContextBuilder, Limits};
pub use crate::errors::{Error, Result};
pub use crate::handler::{complete_connect, restricted_id_ok, ConnAction, ConnectRequest};
pub use crate::message::Message;
pub use crate::reader::{AcceptFn, ReaderLoop};
pub use crate::router::{PublishDecision, SubscriptionIndex};
pub use crate::settings::{Settings, StaticSettings};
pub use crate::storage::{FsStorage, MsgHandle, Storage, StorageFlags, StorageLimits};
pub use crate::topic::{valid_topic_name, Filter, Level, MatchTopic};
pub use crate::transport::{TcpTransport, Transport};
pub use crate::workers::{PoolConfig, WorkerPool};

// the codec is part of the public surface; brokers and clients embed it
pub use mqttd_core as core;
