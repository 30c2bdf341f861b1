//! The MQTT protocol works by exchanging a series of MQTT Control Packets in a defined way.
//!
//! This crate describes the format of these packets for protocol revisions
//! 3.1 (`MQIsdp`, level 3) and 3.1.1 (`MQTT`, level 4), and provides a
//! resumable decoder plus a buffer-oriented encoder.

#[macro_use]
extern crate bitflags;

mod decode;
mod encode;
mod packet;

pub use crate::decode::{decode_variable_length, read_packet, DecodeError};
pub use crate::encode::{encoded_size_of_varint, WriteTo};
pub use crate::packet::*;
