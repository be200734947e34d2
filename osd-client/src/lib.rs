//! # OSD Client Library
//!
//! Host-side driver for an on-chip debug interconnect. A [`Context`] talks to the debug
//! modules of one chip through a [`transport::Transport`] and offers:
//!
//! - **Discovery**: [`Context::connect`] walks the system control module and builds the
//!   module directory ([`directory::SystemInfo`]).
//! - **Register access**: blocking [`Context::read16`] / [`Context::write16`], safe to
//!   call from many threads at once.
//! - **Event dispatch**: per-module handlers for data events
//!   ([`Context::register_packet_handler`]) and trace events
//!   ([`Context::register_trace_handler`]), called from the transport's receiver thread.
//! - **Memory access**: [`Context::memory_write`] / [`Context::memory_read`] through
//!   memory modules, at arbitrary byte addresses and sizes.
//! - **Control**: reset, starting the cores, stalling modules and claiming them.
//!
//! ## Transports
//!
//! - [`transport::DirectTransport`]: a directly attached device, e.g. a character device.
//! - [`transport::DaemonTransport`]: a relay daemon shared by several hosts.
//!
//! ## Example
//!
//! ```no_run
//! use osd_client::{Builder, transport::DaemonTransport};
//! use std::time::Duration;
//!
//! let transport = DaemonTransport::new("localhost:9537").expect("Address should resolve");
//! let ctx = Builder::new()
//!     .rpc_timeout(Duration::from_secs(1))
//!     .build(transport);
//! ctx.connect().expect("System should enumerate");
//!
//! let memory = ctx.system_info().unwrap().memory_modules().next().unwrap().index;
//! ctx.memory_write(memory, 0x1000, b"hello").unwrap();
//! assert_eq!(ctx.memory_read(memory, 0x1000, 5).unwrap(), b"hello");
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`Result`]. [`Error::code`] maps errors onto the numeric
//! [`ResultCode`] domain.

mod context;
pub mod control;
pub mod directory;
mod dispatch;
pub mod error;
pub mod memory;
mod register;
pub mod transport;

pub use context::{Builder, Config, Context};
pub use directory::{BusAddr, ModuleDescriptor, ModuleIndex, ModuleType, SystemInfo};
pub use dispatch::{EventHandler, HandlerId};
pub use error::{Error, Result, ResultCode};
