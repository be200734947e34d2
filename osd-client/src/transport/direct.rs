//! # Direct Link
//!
//! For debug systems attached directly to the host, e.g. through a character device
//! that carries the packet stream. Claims are meaningless here since the host is the
//! only consumer of the link.
//!
//! ## Example Usage
//!
//! ```ignore
//! use osd_client::{Context, transport::DirectTransport};
//!
//! let ctx = Context::new(DirectTransport::new("/dev/osd0"));
//! ctx.connect()?;
//! ```
use std::{
    fs::OpenOptions,
    io::{self, BufReader, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use osd_protocol::Packet;

use super::{PacketSink, Transport, not_connected, spawn_receiver};
use crate::directory::BusAddr;

/// Default upper bound for inbound packets, in words.
pub const DEFAULT_MAX_WORDS: usize = 4096;

enum Endpoint {
    Path(PathBuf),
    Streams {
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    },
}

struct Link {
    writer: Box<dyn Write + Send>,
    _receiver: JoinHandle<()>,
}

/// Transport over a byte stream to a directly attached device.
pub struct DirectTransport {
    endpoint: Mutex<Option<Endpoint>>,
    link: Mutex<Option<Link>>,
    max_words: usize,
}

impl DirectTransport {
    /// A device file, opened for reading and writing on connect.
    pub fn new(path: impl Into<PathBuf>) -> DirectTransport {
        DirectTransport::with_endpoint(Endpoint::Path(path.into()))
    }

    /// An already open pair of streams, e.g. the two halves of a pipe or socket.
    pub fn from_streams(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> DirectTransport {
        DirectTransport::with_endpoint(Endpoint::Streams {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn with_endpoint(endpoint: Endpoint) -> DirectTransport {
        DirectTransport {
            endpoint: Mutex::new(Some(endpoint)),
            link: Mutex::new(None),
            max_words: DEFAULT_MAX_WORDS,
        }
    }

    /// Sets the largest inbound packet accepted, in words.
    pub fn max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    fn open(endpoint: Endpoint) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        match endpoint {
            Endpoint::Path(path) => {
                log::debug!("Opening device: {}", path.display());
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let reader = file.try_clone()?;
                log::info!("Device {} opened", path.display());
                Ok((Box::new(reader), Box::new(file)))
            }
            Endpoint::Streams { reader, writer } => Ok((reader, writer)),
        }
    }
}

impl Transport for DirectTransport {
    fn connect(&self, sink: Arc<dyn PacketSink>) -> io::Result<()> {
        let mut link = self.link.lock().map_err(|_| poisoned())?;
        if link.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "device is already connected",
            ));
        }
        let endpoint = self
            .endpoint
            .lock()
            .map_err(|_| poisoned())?
            .take()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "device link cannot be reopened")
            })?;
        let (reader, writer) = Self::open(endpoint)?;

        let mut reader = BufReader::new(reader);
        let max_words = self.max_words;
        let receiver = spawn_receiver(
            "osd-direct-rx",
            move || Packet::from_reader(&mut reader, max_words).map(Some),
            sink,
        )?;
        *link = Some(Link {
            writer,
            _receiver: receiver,
        });
        Ok(())
    }

    fn send(&self, packet: &Packet) -> io::Result<()> {
        let mut link = self.link.lock().map_err(|_| poisoned())?;
        let link = link.as_mut().ok_or_else(not_connected)?;
        let mut buf = Vec::with_capacity(packet.wire_words() * 2);
        packet.write_to(&mut buf)?;
        link.writer.write_all(&buf)?;
        link.writer.flush()
    }

    fn claim(&self, addr: BusAddr) -> io::Result<()> {
        log::trace!("Claim of module {} on a direct link is a no-op", addr);
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        // A blocking read on a device cannot be interrupted. The receiver
        // stops when the device reports end of file.
        if self.link.lock().map_err(|_| poisoned())?.take().is_some() {
            log::info!("Direct link closed");
        }
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::other("transport lock poisoned")
}
