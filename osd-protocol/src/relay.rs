use crate::packet::Packet;

/// A message exchanged between a host and a relay daemon.
///
/// The daemon owns the physical link to the chip and forwards packets between
/// it and its clients. Clients claim modules to receive their event traffic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelayMessage {
    /// A packet to forward, in either direction.
    Packet(Packet),
    /// Requests exclusive delivery of the events of the module at this bus address.
    Claim(u16),
    /// Gives up a previous claim.
    Release(u16),
}

impl From<Packet> for RelayMessage {
    fn from(value: Packet) -> Self {
        RelayMessage::Packet(value)
    }
}
