use osd_client::directory::{SCM_BUS_ADDR, reg};
use osd_protocol::{HOST_BUS_ADDR, Packet, PacketClass, RegOp};

use crate::{SimModule, modules::ControlModule};

struct Slot {
    module: Box<dyn SimModule>,
    control_status: u16,
}

/// A simulated debug interconnect.
///
/// Bus address 1 holds the system control module; added modules follow in order.
pub struct SimSystem {
    slots: Vec<Slot>,
    max_packet_len: u16,
}

impl SimSystem {
    /// Creates a system that only contains its control module.
    ///
    /// `max_packet_len` is the largest size word the system accepts and produces.
    pub fn new(system_id: u16, max_packet_len: u16) -> SimSystem {
        let mut system = SimSystem {
            slots: Vec::new(),
            max_packet_len,
        };
        system.add(ControlModule::new(system_id, max_packet_len));
        system
    }

    /// Adds a module and returns its bus address.
    pub fn add(&mut self, module: impl SimModule + 'static) -> u16 {
        self.slots.push(Slot {
            module: Box::new(module),
            control_status: 0,
        });
        self.slots.len() as u16
    }

    /// Number of modules, including the control module.
    pub fn module_count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Payload words that fit into one packet.
    pub fn max_payload(&self) -> usize {
        (self.max_packet_len as usize).saturating_sub(2)
    }

    fn slot(&self, bus_addr: u16) -> Option<&Slot> {
        self.slots.get((bus_addr as usize).checked_sub(1)?)
    }

    fn slot_mut(&mut self, bus_addr: u16) -> Option<&mut Slot> {
        self.slots.get_mut((bus_addr as usize).checked_sub(1)?)
    }

    /// Reads a register the way a register read request would.
    pub fn read_register(&self, bus_addr: u16, register: u16) -> Option<u16> {
        if bus_addr == SCM_BUS_ADDR.get() && register == reg::SCM_NUM_MOD {
            return Some(self.module_count());
        }
        let slot = self.slot(bus_addr)?;
        match register {
            reg::MOD_TYPE => Some(slot.module.module_type().code()),
            reg::MOD_VERSION => Some(slot.module.version()),
            reg::MOD_CS => Some(slot.control_status),
            other => slot.module.read_register(other),
        }
    }

    pub fn write_register(&mut self, bus_addr: u16, register: u16, value: u16) -> bool {
        let Some(slot) = self.slot_mut(bus_addr) else {
            return false;
        };
        match register {
            reg::MOD_CS => {
                log::debug!("Module {} control set to {:#06x}", bus_addr, value);
                slot.control_status = value;
                true
            }
            other => slot.module.write_register(other, value),
        }
    }

    /// Processes one packet sent by a host and returns the packets the system answers with.
    pub fn process(&mut self, packet: &Packet) -> Vec<Packet> {
        let bus_addr = packet.dest();
        if self.slot(bus_addr).is_none() {
            log::warn!("Dropping packet for unknown module {}", bus_addr);
            return Vec::new();
        }
        match packet.class() {
            Some(PacketClass::Register) => vec![self.register_access(bus_addr, packet)],
            Some(PacketClass::Event) => {
                let max_payload = self.max_payload();
                match self.slot_mut(bus_addr) {
                    Some(slot) => slot.module.handle_event(bus_addr, packet, max_payload),
                    None => Vec::new(),
                }
            }
            _ => {
                log::warn!("Dropping packet of type {:#06x}", packet.type_field());
                Vec::new()
            }
        }
    }

    fn register_access(&mut self, bus_addr: u16, packet: &Packet) -> Packet {
        let payload = match (packet.reg_op(), packet.payload()) {
            (Some(RegOp::Read16), [register]) => {
                let value = self.read_register(bus_addr, *register);
                log::debug!("read16 {}:{:#06x} = {:?}", bus_addr, register, value);
                // Reads of missing registers answer without data
                value.into_iter().collect()
            }
            (Some(RegOp::Write16), [register, value]) => {
                if !self.write_register(bus_addr, *register, *value) {
                    log::debug!("write16 to missing register {}:{:#06x}", bus_addr, register);
                }
                Vec::new()
            }
            (op, payload) => {
                log::warn!(
                    "Unsupported register access {:?} with {} words",
                    op,
                    payload.len()
                );
                Vec::new()
            }
        };
        Packet::register_response(HOST_BUS_ADDR, bus_addr, payload)
    }

    /// Builds the trace packet a module sends when it observes `payload`.
    pub fn emit_trace(&self, bus_addr: u16, payload: Vec<u16>) -> Packet {
        if self.slot(bus_addr).is_none() {
            log::warn!("Trace from unknown module {}", bus_addr);
        }
        Packet::trace(HOST_BUS_ADDR, bus_addr, payload)
    }
}
