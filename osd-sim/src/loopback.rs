//! In-process transport backed by a [`SimSystem`].
use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        mpsc::{self, Sender},
    },
    thread::{self, JoinHandle},
};

use osd_client::{
    BusAddr,
    transport::{PacketSink, Transport},
};
use osd_protocol::Packet;

use crate::SimSystem;

enum Command {
    Packet(Packet),
    Trace(u16, Vec<u16>),
}

struct Link {
    tx: Sender<Command>,
    worker: JoinHandle<()>,
}

/// Runs a simulated system on a worker thread that plays the role of the chip.
///
/// Packets sent through the transport are queued to the worker; everything the system
/// answers is delivered from the worker thread, like a transport's receiver would.
pub struct LoopbackTransport {
    system: Arc<Mutex<SimSystem>>,
    link: Mutex<Option<Link>>,
}

impl LoopbackTransport {
    pub fn new(system: SimSystem) -> LoopbackTransport {
        LoopbackTransport {
            system: Arc::new(Mutex::new(system)),
            link: Mutex::new(None),
        }
    }

    /// The simulated system, for inspection and modification.
    pub fn system(&self) -> Arc<Mutex<SimSystem>> {
        self.system.clone()
    }

    /// Makes module `bus_addr` send a trace packet carrying `payload`.
    pub fn emit_trace(&self, bus_addr: u16, payload: Vec<u16>) -> io::Result<()> {
        self.command(Command::Trace(bus_addr, payload))
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self, command: Command) -> io::Result<()> {
        let link = self.link();
        let link = link
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "loopback is not connected"))?;
        link.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback worker stopped"))
    }
}

fn run(system: Arc<Mutex<SimSystem>>, rx: mpsc::Receiver<Command>, sink: Arc<dyn PacketSink>) {
    for command in rx {
        let outbound = {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            match command {
                Command::Packet(packet) => system.process(&packet),
                Command::Trace(bus_addr, payload) => vec![system.emit_trace(bus_addr, payload)],
            }
        };
        for packet in outbound {
            sink.handle_inbound(packet);
        }
    }
    log::debug!("Loopback worker stopped");
    sink.disconnected();
}

impl Transport for LoopbackTransport {
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()> {
        let mut link = self.link();
        if link.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "loopback is already connected",
            ));
        }
        let (tx, rx) = mpsc::channel();
        let system = self.system.clone();
        let worker = thread::Builder::new()
            .name("osd-sim-loopback".to_string())
            .spawn(move || run(system, rx, sink))?;
        *link = Some(Link { tx, worker });
        Ok(())
    }

    fn send(&self, packet: &Packet) -> io::Result<()> {
        self.command(Command::Packet(packet.clone()))
    }

    fn claim(&self, addr: BusAddr) -> io::Result<()> {
        log::debug!("Claim of module {} needs no action", addr);
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        let Some(Link { tx, worker }) = self.link().take() else {
            return Ok(());
        };
        drop(tx);
        // A handler running on the worker may close the link itself
        if worker.thread().id() != thread::current().id() && worker.join().is_err() {
            log::error!("Loopback worker panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{sync::mpsc::Receiver, time::Duration};

    use super::*;
    use crate::modules::TraceModule;
    use osd_protocol::{PacketClass, RegOp};

    struct ChannelSink(Mutex<mpsc::Sender<Option<Packet>>>);

    impl PacketSink for ChannelSink {
        fn handle_inbound(&self, packet: Packet) {
            let _ = self.0.lock().unwrap().send(Some(packet));
        }

        fn disconnected(&self) {
            let _ = self.0.lock().unwrap().send(None);
        }
    }

    fn connected() -> (LoopbackTransport, Receiver<Option<Packet>>) {
        let mut system = SimSystem::new(1, 16);
        system.add(TraceModule::new(32));
        let transport = LoopbackTransport::new(system);
        let (tx, rx) = mpsc::channel();
        transport.connect(Arc::new(ChannelSink(Mutex::new(tx)))).unwrap();
        (transport, rx)
    }

    #[test]
    fn answers_register_requests() {
        let (transport, rx) = connected();
        transport
            .send(&Packet::register_request(2, RegOp::Read16, vec![0x200]))
            .unwrap();
        let response = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(response.class(), Some(PacketClass::Register));
        assert_eq!(response.payload(), &[32]);
    }

    #[test]
    fn delivers_traces() {
        let (transport, rx) = connected();
        transport.emit_trace(2, vec![0xabc]).unwrap();
        let trace = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(trace.class(), Some(PacketClass::Trace));
        assert_eq!(trace.class_payload(), 2);
    }

    #[test]
    fn disconnect_stops_delivery() {
        let (transport, rx) = connected();
        transport.disconnect().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_none());
        assert!(transport.send(&Packet::event(2, 0, vec![])).is_err());
        transport.disconnect().unwrap();
    }

    #[test]
    fn connect_twice_fails() {
        let (transport, _rx) = connected();
        let (tx, _rx2) = mpsc::channel();
        let err = transport
            .connect(Arc::new(ChannelSink(Mutex::new(tx))))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
