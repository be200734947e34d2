//! # OSD Protocol Library
//!
//! Wire format of an on-chip debug interconnect: a small packet protocol that lets a
//! host read and write registers and memory of debug modules inside a many-core chip
//! and receive asynchronous event and trace packets from them.
//!
//! ## Packet Format
//!
//! A packet is a sequence of 16-bit words:
//!
//! - **word 0**: number of words following it
//! - **word 1**: destination bus address (low 10 bits)
//! - **word 2**: type. Bits 14-15 select the class (register, event, trace),
//!   bits 10-13 the subtype (register operation or event length),
//!   bits 0-9 carry the source bus address on packets sent by a module
//! - **word 3..**: payload
//!
//! ```
//! use osd_protocol::{Packet, RegOp};
//!
//! let packet = Packet::register_request(5, RegOp::Write16, vec![0x203, 3]);
//! assert_eq!(packet.to_words().unwrap(), vec![4, 5, 0x1000, 0x203, 3]);
//! ```
//!
//! On byte streams each word is transferred little-endian:
//!
//! ```
//! use osd_protocol::Packet;
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(vec![0x03, 0x00, 0x00, 0x00, 0x05, 0x00, 0x34, 0x12]);
//! let packet = Packet::from_reader(&mut reader, 64).expect("Packet should parse");
//! assert_eq!(packet.class_payload(), 5);
//! assert_eq!(packet.payload(), &[0x1234]);
//! ```
//!
//! ## Memory Access
//!
//! Memory modules are driven with event packets whose payload starts with a header,
//! see [`memory`].
//!
//! ## Relay Daemon
//!
//! Hosts that share a chip talk to a relay daemon using [`RelayMessage`]s, which wrap
//! packets and module claims.
//!
//! ## Error Handling
//!
//! Framing violations are reported as [`error::PacketError`], stream decoding failures as
//! [`error::ReadError`].
//!
//! ## Features
//!
//! - `tokio`: `tokio_util` codecs for packets and relay messages in [`framed`].

pub mod packet;
pub use packet::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod framed;
pub mod memory;
pub mod relay;
pub use relay::RelayMessage;
