//! Thin client façade over the mqttd runtime.
//!
//! Two idioms are offered for every operation: blocking calls that wait
//! for the acknowledgment flow of the requested QoS, and `_async`
//! variants that return immediately and invoke a callback on a worker
//! once the operation completed or failed.

#[macro_use]
extern crate log;

mod client;
mod options;

pub use crate::client::Client;
pub use crate::options::ClientOptions;

pub use mqttd_core::{ConnectReturnCode, Protocol, QoS, SubscribeReturnCode};
pub use mqttd_proto::{Error, Message, Result};
