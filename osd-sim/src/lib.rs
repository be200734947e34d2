//! # OSD Simulator Library
//!
//! A software model of an on-chip debug interconnect. It answers the same packets a
//! chip would, which makes it possible to drive the client without hardware.
//!
//! ## Architecture
//!
//! - **[`SimModule`] Trait**: one debug module. Implementations answer their type
//!   specific registers and, for memory modules, the memory access protocol.
//! - **[`SimSystem`]**: the interconnect. It owns the system control module at bus
//!   address 1 and places every added module at the next free bus address.
//! - **[`loopback::LoopbackTransport`]**: runs a system in-process as a client transport.
//! - **[`server::Server`]**: serves a system to any number of hosts as a relay daemon.
//!
//! ## Basic Usage
//!
//! ```
//! use osd_sim::{SimSystem, modules::{MemoryModule, TraceModule}};
//!
//! let mut system = SimSystem::new(0xcafe, 64);
//! let memory = system.add(MemoryModule::new(32, 32, 0, 0x1000));
//! let trace = system.add(TraceModule::new(32));
//! assert_eq!((memory, trace), (2, 3));
//! ```
//!
//! ## Serving a System
//!
//! ```ignore
//! use osd_sim::server::Builder;
//!
//! let server = Builder::new().max_packet_words(1024).build(system);
//! server.listen("127.0.0.1:9537").await?;
//! ```
//!
//! ## Logging
//!
//! Every register access and memory transfer is logged at `debug` level,
//! malformed packets at `warn` level.
use osd_client::ModuleType;
use osd_protocol::Packet;

pub mod loopback;
pub mod modules;
pub mod server;
mod system;

pub use system::SimSystem;

/// A simulated debug module.
///
/// The registers shared by all modules (type, version and control/status) are
/// answered by [`SimSystem`]; implementations only provide their own.
pub trait SimModule: Send {
    fn module_type(&self) -> ModuleType;

    fn version(&self) -> u16 {
        1
    }

    /// Reads a type specific register. `None` for registers the module does not have.
    fn read_register(&self, reg: u16) -> Option<u16>;

    /// Writes a type specific register. Returns `false` for registers the module does not have.
    fn write_register(&mut self, _reg: u16, _value: u16) -> bool {
        false
    }

    /// Handles an event packet addressed to the module and returns the packets it sends back.
    ///
    /// `bus_addr` is the module's own address, `max_payload` the number of payload words
    /// that fit into one packet.
    fn handle_event(&mut self, bus_addr: u16, packet: &Packet, max_payload: usize) -> Vec<Packet> {
        let _ = max_payload;
        log::debug!(
            "Module {} ignores event with {} words",
            bus_addr,
            packet.payload().len()
        );
        Vec::new()
    }
}
