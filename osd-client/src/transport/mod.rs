//! Byte delivery between the host and the debug system.
//!
//! A [`Transport`] sends packets and runs its own receiver thread, which hands every
//! complete inbound packet to the [`PacketSink`] passed to [`Transport::connect`].
use std::{
    io::{self, ErrorKind},
    sync::Arc,
    thread::{self, JoinHandle},
};

use osd_protocol::{Packet, error::ReadError};

use crate::directory::BusAddr;

pub mod daemon;
pub mod direct;

pub use daemon::DaemonTransport;
pub use direct::DirectTransport;

#[cfg(test)]
pub(crate) mod mock;

/// Receives every packet a transport reads.
pub trait PacketSink: Send + Sync {
    fn handle_inbound(&self, packet: Packet);

    /// Called once when the transport stops delivering packets.
    fn disconnected(&self) {}
}

/// A link to the debug system.
pub trait Transport: Send + Sync {
    /// Opens the link and starts delivering inbound packets to `sink`.
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()>;

    /// Best-effort write of one packet.
    fn send(&self, packet: &Packet) -> io::Result<()>;

    /// Requests exclusive delivery of the events of a module.
    fn claim(&self, addr: BusAddr) -> io::Result<()>;

    /// Gives up a claim.
    fn release(&self, _addr: BusAddr) -> io::Result<()> {
        Ok(())
    }

    /// Closes the link. Inbound delivery stops.
    fn disconnect(&self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()> {
        (**self).connect(sink)
    }

    fn send(&self, packet: &Packet) -> io::Result<()> {
        (**self).send(packet)
    }

    fn claim(&self, addr: BusAddr) -> io::Result<()> {
        (**self).claim(addr)
    }

    fn release(&self, addr: BusAddr) -> io::Result<()> {
        (**self).release(addr)
    }

    fn disconnect(&self) -> io::Result<()> {
        (**self).disconnect()
    }
}

/// Runs `read` in a dedicated thread until it fails, forwarding every packet to `sink`.
/// `read` returns `None` for messages that carry no packet.
pub(crate) fn spawn_receiver<F>(
    name: &str,
    mut read: F,
    sink: Arc<dyn PacketSink>,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut() -> Result<Option<Packet>, ReadError> + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                match read() {
                    Ok(Some(packet)) => sink.handle_inbound(packet),
                    Ok(None) => {}
                    Err(ReadError::IoError(err))
                        if matches!(
                            err.kind(),
                            ErrorKind::UnexpectedEof
                                | ErrorKind::ConnectionAborted
                                | ErrorKind::ConnectionReset
                                | ErrorKind::NotConnected
                        ) =>
                    {
                        log::info!("Link closed");
                        break;
                    }
                    Err(err) => {
                        log::error!("Receive error, stopping receiver: {}", err);
                        break;
                    }
                }
            }
            sink.disconnected();
        })
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "transport is not connected")
}
