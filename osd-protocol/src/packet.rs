use std::fmt::Display;

use crate::error::PacketError;

/// Mask selecting the significant bits of a bus address.
pub const BUS_ADDR_MASK: u16 = 0x3ff;

/// Highest valid bus address on the interconnect.
pub const MAX_BUS_ADDR: u16 = BUS_ADDR_MASK;

/// Bus address of the host.
pub const HOST_BUS_ADDR: u16 = 0;

/// Number of words every packet carries before its payload (size, destination, type).
pub const HEADER_WORDS: usize = 3;

/// Largest value the size word may hold.
pub const MAX_SIZE_WORD: usize = u16::MAX as usize;

const CLASS_SHIFT: u16 = 14;
const SUBTYPE_SHIFT: u16 = 10;
const SUBTYPE_MASK: u16 = 0xf;

/// The coarse class of a packet, stored in the top bits of the type word.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketClass {
    /// Synchronous register read/write request or response.
    Register,
    /// Data event, e.g. memory transfers or terminal output.
    Event,
    /// Trace event emitted by a trace module.
    Trace,
}

impl PacketClass {
    pub fn from_bits(bits: u16) -> Option<PacketClass> {
        match bits {
            0 => Some(PacketClass::Register),
            1 => Some(PacketClass::Event),
            2 => Some(PacketClass::Trace),
            _ => None,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            PacketClass::Register => 0,
            PacketClass::Event => 1,
            PacketClass::Trace => 2,
        }
    }
}

/// Register access operations, selected by the subtype of a register-class packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegOp {
    Read16 = 0,
    Read32 = 1,
    Read64 = 2,
    Read128 = 3,
    Write16 = 4,
    Write32 = 5,
    Write64 = 6,
    Write128 = 7,
}

impl RegOp {
    pub fn from_code(code: u16) -> Option<RegOp> {
        Some(match code {
            0 => RegOp::Read16,
            1 => RegOp::Read32,
            2 => RegOp::Read64,
            3 => RegOp::Read128,
            4 => RegOp::Write16,
            5 => RegOp::Write32,
            6 => RegOp::Write64,
            7 => RegOp::Write128,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_write(self) -> bool {
        self.code() >= RegOp::Write16.code()
    }

    /// The number of 16-bit words moved by this operation.
    pub fn data_words(self) -> usize {
        1 << (self.code() & 0x3)
    }
}

/// Builds a type word from its three fields.
pub fn type_word(class: PacketClass, subtype: u16, class_payload: u16) -> u16 {
    (class.bits() << CLASS_SHIFT)
        | ((subtype & SUBTYPE_MASK) << SUBTYPE_SHIFT)
        | (class_payload & BUS_ADDR_MASK)
}

/// A single packet on the debug interconnect.
///
/// On the wire a packet is a sequence of 16-bit words:
/// `[size, dest, type, payload...]` where `size` counts the words following it.
/// The size word is always derived from the payload and never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    dest: u16,
    type_field: u16,
    payload: Vec<u16>,
}

impl Packet {
    /// Creates a packet from its raw fields.
    /// The destination is truncated to the significant bus address bits.
    pub fn new(dest: u16, type_field: u16, payload: Vec<u16>) -> Packet {
        Packet {
            dest: dest & BUS_ADDR_MASK,
            type_field,
            payload,
        }
    }

    /// A register access request from the host.
    pub fn register_request(dest: u16, op: RegOp, payload: Vec<u16>) -> Packet {
        Packet::new(dest, type_word(PacketClass::Register, op.code(), 0), payload)
    }

    /// A register access response originating from `source`.
    pub fn register_response(dest: u16, source: u16, payload: Vec<u16>) -> Packet {
        Packet::new(dest, type_word(PacketClass::Register, 0, source), payload)
    }

    /// A data event packet. The subtype carries the payload length when it fits into it.
    pub fn event(dest: u16, source: u16, payload: Vec<u16>) -> Packet {
        let subtype = event_subtype(payload.len());
        Packet::new(dest, type_word(PacketClass::Event, subtype, source), payload)
    }

    /// A trace event packet.
    pub fn trace(dest: u16, source: u16, payload: Vec<u16>) -> Packet {
        let subtype = event_subtype(payload.len());
        Packet::new(dest, type_word(PacketClass::Trace, subtype, source), payload)
    }

    pub fn dest(&self) -> u16 {
        self.dest
    }

    pub fn type_field(&self) -> u16 {
        self.type_field
    }

    pub fn payload(&self) -> &[u16] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u16> {
        self.payload
    }

    /// The value of the size word, i.e. the number of words following it.
    pub fn size(&self) -> usize {
        self.payload.len() + HEADER_WORDS - 1
    }

    /// Number of words the packet occupies on the wire.
    pub fn wire_words(&self) -> usize {
        self.payload.len() + HEADER_WORDS
    }

    /// The coarse class, `None` for reserved class bits.
    pub fn class(&self) -> Option<PacketClass> {
        PacketClass::from_bits(self.type_field >> CLASS_SHIFT)
    }

    /// Bits 10 to 13 of the type word.
    pub fn subtype(&self) -> u16 {
        (self.type_field >> SUBTYPE_SHIFT) & SUBTYPE_MASK
    }

    /// Bits 0 to 9 of the type word. For inbound packets this is the source bus address.
    pub fn class_payload(&self) -> u16 {
        self.type_field & BUS_ADDR_MASK
    }

    /// The register operation, if this is a register-class packet.
    pub fn reg_op(&self) -> Option<RegOp> {
        match self.class() {
            Some(PacketClass::Register) => RegOp::from_code(self.subtype() & 0x7),
            _ => None,
        }
    }

    /// The wire representation, size word first.
    pub fn to_words(&self) -> Result<Vec<u16>, PacketError> {
        let size = self.size();
        if size > MAX_SIZE_WORD {
            return Err(PacketError::TooLarge {
                max: MAX_SIZE_WORD,
                got: size,
            });
        }
        let mut words = Vec::with_capacity(self.wire_words());
        words.push(size as u16);
        words.push(self.dest);
        words.push(self.type_field);
        words.extend_from_slice(&self.payload);
        Ok(words)
    }

    /// Parses a complete packet. The slice must hold exactly `words[0] + 1` words.
    pub fn from_words(words: &[u16]) -> Result<Packet, PacketError> {
        if words.len() < HEADER_WORDS {
            return Err(PacketError::Truncated {
                expected: HEADER_WORDS,
                got: words.len(),
            });
        }
        let expected = words[0] as usize + 1;
        if expected != words.len() {
            return Err(PacketError::SizeMismatch {
                declared: words[0] as usize,
                actual: words.len() - 1,
            });
        }
        Ok(Packet::new(words[1], words[2], words[3..].to_vec()))
    }
}

fn event_subtype(payload_len: usize) -> u16 {
    if payload_len <= SUBTYPE_MASK as usize {
        payload_len as u16
    } else {
        0
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#06x} {:#06x} {:#06x}",
            self.size(),
            self.dest,
            self.type_field
        )?;
        for word in &self.payload {
            write!(f, " {:#06x}", word)?;
        }
        write!(f, "]")
    }
}

#[test]
fn write16_request_words() {
    let packet = Packet::register_request(5, RegOp::Write16, vec![0x203, 3]);
    assert_eq!(packet.to_words().unwrap(), vec![4, 5, 0x1000, 0x203, 3]);
}

#[test]
fn read16_request_words() {
    let packet = Packet::register_request(5, RegOp::Read16, vec![0x203]);
    assert_eq!(packet.to_words().unwrap(), vec![3, 5, 0x0000, 0x203]);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classes_from_type_word() {
        let reg = Packet::new(0, 0x0000, vec![]);
        let event = Packet::new(0, 0x4000 | 7, vec![]);
        let trace = Packet::new(0, 0x8000 | 7, vec![]);
        let reserved = Packet::new(0, 0xc000, vec![]);
        assert_eq!(reg.class(), Some(PacketClass::Register));
        assert_eq!(event.class(), Some(PacketClass::Event));
        assert_eq!(trace.class(), Some(PacketClass::Trace));
        assert_eq!(reserved.class(), None);
        assert_eq!(event.class_payload(), 7);
    }

    #[test]
    fn event_carries_source_and_length() {
        let packet = Packet::event(HOST_BUS_ADDR, 3, vec![1, 2, 3]);
        assert_eq!(packet.class(), Some(PacketClass::Event));
        assert_eq!(packet.class_payload(), 3);
        assert_eq!(packet.subtype(), 3);

        let long = Packet::event(HOST_BUS_ADDR, 3, vec![0; 20]);
        assert_eq!(long.subtype(), 0);
    }

    #[test]
    fn destination_is_masked() {
        let packet = Packet::new(0xffff, 0, vec![]);
        assert_eq!(packet.dest(), 0x3ff);
    }

    #[test]
    fn reg_op_codes() {
        assert_eq!(RegOp::from_code(4), Some(RegOp::Write16));
        assert_eq!(RegOp::from_code(8), None);
        assert!(RegOp::Write64.is_write());
        assert!(!RegOp::Read128.is_write());
        assert_eq!(RegOp::Read64.data_words(), 4);
        assert_eq!(RegOp::Write16.data_words(), 1);
    }

    #[test]
    fn parse_words() {
        let packet = Packet::from_words(&[4, 5, 0x1000, 0x203, 3]).unwrap();
        assert_eq!(packet.dest(), 5);
        assert_eq!(packet.reg_op(), Some(RegOp::Write16));
        assert_eq!(packet.payload(), &[0x203, 3]);
    }

    #[test]
    fn parse_rejects_size_mismatch() {
        match Packet::from_words(&[3, 5, 0, 0x203, 0x1234]) {
            Err(PacketError::SizeMismatch { declared, actual }) => {
                assert_eq!(declared, 3);
                assert_eq!(actual, 4);
            }
            other => panic!("expected SizeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_truncated() {
        assert!(matches!(
            Packet::from_words(&[1, 5]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_packet_cannot_be_encoded() {
        let packet = Packet::new(1, 0, vec![0; MAX_SIZE_WORD]);
        assert!(matches!(
            packet.to_words(),
            Err(PacketError::TooLarge { .. })
        ));
    }
}
