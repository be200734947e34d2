//! Shared fixtures for the end-to-end tests of the client against the simulator.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use osd_client::{Builder, Context};
use osd_sim::{
    SimSystem,
    loopback::LoopbackTransport,
    modules::{CoreTraceModule, MemoryModule, Storage, TraceModule},
    server::{self, Server},
};
use tokio::net::TcpListener;

pub const SYSTEM_ID: u16 = 0x05d0;
pub const MEMORY_BASE: u64 = 0x1000_0000;
pub const MEMORY_SIZE: usize = 0x1_0000;

pub const MEMORY_MODULE: u16 = 2;
pub const TRACE_MODULE: u16 = 3;
pub const CORE_TRACE_MODULE: u16 = 4;

/// Control, memory, software trace and core trace, in that bus order.
pub fn demo_system(max_packet_len: u16) -> (SimSystem, Storage) {
    let mut system = SimSystem::new(SYSTEM_ID, max_packet_len);
    let memory = MemoryModule::new(32, 32, MEMORY_BASE, MEMORY_SIZE);
    let storage = memory.storage();
    system.add(memory);
    system.add(TraceModule::new(32));
    system.add(CoreTraceModule::new(32, 64));
    (system, storage)
}

pub struct Loopback {
    pub ctx: Context,
    pub transport: Arc<LoopbackTransport>,
    pub storage: Storage,
}

/// A connected context talking to [`demo_system`] in-process.
pub fn loopback(max_packet_len: u16) -> Loopback {
    let (system, storage) = demo_system(max_packet_len);
    let transport = Arc::new(LoopbackTransport::new(system));
    let ctx = Builder::new()
        .rpc_timeout(Duration::from_secs(5))
        .build(transport.clone());
    ctx.connect().expect("Simulated system should enumerate");
    Loopback {
        ctx,
        transport,
        storage,
    }
}

/// Serves [`demo_system`] as a relay daemon on an ephemeral local port.
pub async fn start_daemon(max_packet_len: u16) -> (Server, SocketAddr, Storage) {
    let (system, storage) = demo_system(max_packet_len);
    let server = server::Builder::new()
        .max_packet_words(max_packet_len as usize + 1)
        .build(system);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Should bind to a local port");
    let addr = listener.local_addr().expect("Listener should have an address");
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr, storage)
}

/// Deterministic test data.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}
