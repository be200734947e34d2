//! # Relay Daemon
//!
//! For debug systems shared through a relay daemon. The daemon owns the link to the
//! chip, forwards packets in both directions and delivers the events of a module to
//! the client that claimed it.
use std::{
    io::{self, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use osd_protocol::{Packet, RelayMessage};

use super::{PacketSink, Transport, direct::DEFAULT_MAX_WORDS, not_connected, spawn_receiver};
use crate::directory::BusAddr;

struct Link {
    tcp: TcpStream,
    receiver: JoinHandle<()>,
}

/// Transport over a TCP connection to a relay daemon.
pub struct DaemonTransport {
    addrs: Vec<SocketAddr>,
    link: Mutex<Option<Link>>,
    max_words: usize,
}

impl DaemonTransport {
    pub fn new(addr: impl ToSocketAddrs) -> io::Result<DaemonTransport> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "daemon address did not resolve",
            ));
        }
        Ok(DaemonTransport {
            addrs,
            link: Mutex::new(None),
            max_words: DEFAULT_MAX_WORDS,
        })
    }

    /// Sets the largest inbound packet accepted, in words.
    pub fn max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    fn write_message(&self, message: &RelayMessage) -> io::Result<()> {
        let mut buf = Vec::new();
        message.write_to(&mut buf)?;
        let mut link = self.link.lock().map_err(|_| poisoned())?;
        let link = link.as_mut().ok_or_else(not_connected)?;
        link.tcp.write_all(&buf)
    }
}

impl Transport for DaemonTransport {
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()> {
        let mut link = self.link.lock().map_err(|_| poisoned())?;
        if link.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "daemon is already connected",
            ));
        }
        let tcp = TcpStream::connect(&self.addrs[..])?;
        tcp.set_nodelay(true)?;
        if let Ok(peer) = tcp.peer_addr() {
            log::info!("Connected to relay daemon at {}", peer);
        }

        let mut reader = BufReader::new(tcp.try_clone()?);
        let max_words = self.max_words;
        let receiver = spawn_receiver(
            "osd-daemon-rx",
            move || match RelayMessage::from_reader(&mut reader, max_words)? {
                RelayMessage::Packet(packet) => Ok(Some(packet)),
                other => {
                    log::debug!("Ignoring relay message {:?}", other);
                    Ok(None)
                }
            },
            sink,
        )?;
        *link = Some(Link { tcp, receiver });
        Ok(())
    }

    fn send(&self, packet: &Packet) -> io::Result<()> {
        let mut buf = Vec::with_capacity(packet.wire_words() * 2 + 8);
        RelayMessage::write_packet(packet, &mut buf)?;
        let mut link = self.link.lock().map_err(|_| poisoned())?;
        let link = link.as_mut().ok_or_else(not_connected)?;
        link.tcp.write_all(&buf)
    }

    fn claim(&self, addr: BusAddr) -> io::Result<()> {
        log::debug!("Claiming module {}", addr);
        self.write_message(&RelayMessage::Claim(addr.get()))
    }

    fn release(&self, addr: BusAddr) -> io::Result<()> {
        log::debug!("Releasing module {}", addr);
        self.write_message(&RelayMessage::Release(addr.get()))
    }

    fn disconnect(&self) -> io::Result<()> {
        let link = self.link.lock().map_err(|_| poisoned())?.take();
        if let Some(link) = link {
            let _ = link.tcp.shutdown(Shutdown::Both);
            if link.receiver.join().is_err() {
                log::error!("Receiver thread panicked");
            }
            log::info!("Disconnected from relay daemon");
        }
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::other("transport lock poisoned")
}
