use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use osd_protocol::{HOST_BUS_ADDR, Packet, RegOp};

use super::{PacketSink, Transport, not_connected};
use crate::directory::BusAddr;

type EventResponder = Box<dyn Fn(&Packet) -> Vec<Packet> + Send + Sync>;

/// Answers register requests from a register map and event packets through a closure.
/// Responses are delivered synchronously from within `send`.
pub(crate) struct MockTransport {
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    pub sent: Mutex<Vec<Packet>>,
    pub claims: Mutex<Vec<(bool, BusAddr)>>,
    pub registers: Mutex<HashMap<(u16, u16), u16>>,
    pub answer_registers: AtomicBool,
    events: EventResponder,
}

impl MockTransport {
    pub fn new(registers: HashMap<(u16, u16), u16>) -> Arc<MockTransport> {
        MockTransport::with_events(registers, |_| Vec::new())
    }

    pub fn with_events(
        registers: HashMap<(u16, u16), u16>,
        events: impl Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static,
    ) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            claims: Mutex::new(Vec::new()),
            registers: Mutex::new(registers),
            answer_registers: AtomicBool::new(true),
            events: Box::new(events),
        })
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn register(&self, addr: u16, reg: u16) -> Option<u16> {
        self.registers.lock().unwrap().get(&(addr, reg)).copied()
    }

    fn respond(&self, packet: &Packet) -> Vec<Packet> {
        let source = packet.dest();
        match packet.reg_op() {
            Some(_) if !self.answer_registers.load(Ordering::SeqCst) => Vec::new(),
            Some(RegOp::Read16) => {
                let value = self.register(source, packet.payload()[0]).unwrap_or(0);
                vec![Packet::register_response(HOST_BUS_ADDR, source, vec![value])]
            }
            Some(RegOp::Write16) => {
                let payload = packet.payload();
                self.registers
                    .lock()
                    .unwrap()
                    .insert((source, payload[0]), payload[1]);
                vec![Packet::register_response(HOST_BUS_ADDR, source, vec![])]
            }
            Some(_) => Vec::new(),
            None => (self.events)(packet),
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn send(&self, packet: &Packet) -> io::Result<()> {
        let sink = self.sink.lock().unwrap().clone().ok_or_else(not_connected)?;
        self.sent.lock().unwrap().push(packet.clone());
        for response in self.respond(packet) {
            sink.handle_inbound(response);
        }
        Ok(())
    }

    fn claim(&self, addr: BusAddr) -> io::Result<()> {
        self.claims.lock().unwrap().push((true, addr));
        Ok(())
    }

    fn release(&self, addr: BusAddr) -> io::Result<()> {
        self.claims.lock().unwrap().push((false, addr));
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.disconnected();
        }
        Ok(())
    }
}
