//! Relay daemon serving a [`SimSystem`] to several hosts.
//!
//! Every host speaks [`RelayMessage`]s. Whatever the system answers to a packet goes back
//! to the host that sent it. Unsolicited packets, such as traces, go to the host that
//! claimed the sending module, or to every host while it is unclaimed.
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use osd_protocol::{Packet, RelayMessage, framed::RelayCodec};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs, tcp::OwnedWriteHalf},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::SimSystem;

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest packet accepted from a host, in words.
    pub max_packet_words: usize,
    /// Time allowed for writing to a host and for completing a partially received message.
    pub read_write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_words: 4096,
            read_write_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use osd_sim::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_packet_words(1024)
///     .rw_timeout(Duration::from_secs(20))
///     .build(system);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest packet that this server is expected to receive.
    pub fn max_packet_words(mut self, words: usize) -> Self {
        self.config.max_packet_words = words;
        self
    }

    /// Set the TCP read and write timeout
    pub fn rw_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    /// Build and return the server
    pub fn build(self, system: SimSystem) -> Server {
        Server::new(system, self.config)
    }
}

type ClientId = u64;

struct Shared {
    system: Mutex<SimSystem>,
    clients: Mutex<HashMap<ClientId, UnboundedSender<RelayMessage>>>,
    claims: Mutex<HashMap<u16, ClientId>>,
    next_client: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn register(&self, tx: UnboundedSender<RelayMessage>) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        lock(&self.clients).insert(id, tx);
        id
    }

    fn unregister(&self, id: ClientId) {
        lock(&self.clients).remove(&id);
        lock(&self.claims).retain(|bus, owner| {
            if *owner == id {
                log::debug!("Releasing module {} of departed client {}", bus, id);
            }
            *owner != id
        });
    }

    fn send_to(&self, id: ClientId, packet: Packet) {
        if let Some(tx) = lock(&self.clients).get(&id) {
            let _ = tx.send(RelayMessage::Packet(packet));
        }
    }

    /// Routes an unsolicited packet to the claimant of its source module, or to everyone.
    fn deliver_event(&self, packet: Packet) {
        let owner = lock(&self.claims).get(&packet.class_payload()).copied();
        match owner {
            Some(id) => self.send_to(id, packet),
            None => {
                for tx in lock(&self.clients).values() {
                    let _ = tx.send(RelayMessage::Packet(packet.clone()));
                }
            }
        }
    }

    fn process(&self, id: ClientId, message: RelayMessage) {
        match message {
            RelayMessage::Packet(packet) => {
                log::trace!("Client {} sent {}", id, packet);
                let responses = lock(&self.system).process(&packet);
                for response in responses {
                    self.send_to(id, response);
                }
            }
            RelayMessage::Claim(bus) => {
                if let Some(previous) = lock(&self.claims).insert(bus, id)
                    && previous != id
                {
                    log::warn!("Client {} took module {} from client {}", id, bus, previous);
                }
                log::info!("Client {} claimed module {}", id, bus);
            }
            RelayMessage::Release(bus) => {
                let mut claims = lock(&self.claims);
                if claims.get(&bus) == Some(&id) {
                    claims.remove(&bus);
                    log::info!("Client {} released module {}", id, bus);
                }
            }
        }
    }
}

/// A relay daemon in front of a simulated system.
///
/// Cloning a server yields another handle to the same system and clients.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    config: Config,
}

impl Server {
    pub fn new(system: SimSystem, config: Config) -> Server {
        Server {
            shared: Arc::new(Shared {
                system: Mutex::new(system),
                clients: Mutex::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(0),
            }),
            config,
        }
    }

    /// Makes module `bus_addr` send a trace packet carrying `payload`.
    pub fn emit_trace(&self, bus_addr: u16, payload: Vec<u16>) {
        let packet = lock(&self.shared.system).emit_trace(bus_addr, payload);
        self.shared.deliver_event(packet);
    }

    /// Runs `f` with exclusive access to the simulated system.
    pub fn with_system<R>(&self, f: impl FnOnce(&mut SimSystem) -> R) -> R {
        f(&mut lock(&self.shared.system))
    }

    /// Number of connected hosts.
    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts hosts on an already bound listener until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        log::info!("Server listening for connections on {}", listener.local_addr()?);
        loop {
            let (tcp, peer_addr) = listener.accept().await?;
            log::info!("New client connection from {}", peer_addr);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(tcp).await {
                    log::error!("Client error: {}", e);
                }
                log::info!("Client {} disconnected", peer_addr);
            });
        }
    }

    async fn handle_client(&self, tcp: TcpStream) -> io::Result<()> {
        tcp.set_nodelay(true)?;
        let (mut reader, writer) = tcp.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.register(tx);
        let writer = tokio::spawn(write_messages(
            writer,
            rx,
            self.config.max_packet_words,
            self.config.read_write_timeout,
        ));

        let mut codec = RelayCodec::new(self.config.max_packet_words);
        let mut buf = BytesMut::with_capacity(4096);
        let result = loop {
            match codec.decode(&mut buf) {
                Ok(Some(message)) => {
                    self.shared.process(id, message);
                    continue;
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            let read = if buf.is_empty() {
                reader.read_buf(&mut buf).await
            } else {
                match timeout(self.config.read_write_timeout, reader.read_buf(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        log::error!("Client read timeout, closing connection");
                        break Ok(());
                    }
                }
            };
            match read {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(err)
                    if err.kind() == ErrorKind::ConnectionAborted
                        || err.kind() == ErrorKind::ConnectionReset =>
                {
                    break Ok(());
                } // Client disconnected
                Err(err) => break Err(err),
            }
        };

        self.shared.unregister(id);
        match writer.await {
            Ok(Err(e)) if result.is_ok() => Err(e),
            _ => result,
        }
    }
}

async fn write_messages(
    mut writer: OwnedWriteHalf,
    mut rx: UnboundedReceiver<RelayMessage>,
    max_packet_words: usize,
    write_timeout: Duration,
) -> io::Result<()> {
    let mut codec = RelayCodec::new(max_packet_words);
    let mut buf = BytesMut::new();
    while let Some(message) = rx.recv().await {
        codec.encode(message, &mut buf)?;
        timeout(write_timeout, writer.write_all_buf(&mut buf))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "client write timeout"))??;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::{MemoryModule, TraceModule};
    use osd_protocol::{PacketClass, RegOp};

    fn server() -> Server {
        let mut system = SimSystem::new(0x77, 32);
        system.add(MemoryModule::new(32, 32, 0, 256));
        system.add(TraceModule::new(32));
        Builder::new().max_packet_words(64).build(system)
    }

    /// A host speaking relay messages over a raw socket.
    struct Host {
        tcp: TcpStream,
        codec: RelayCodec,
        buf: BytesMut,
    }

    impl Host {
        async fn connect(addr: std::net::SocketAddr) -> Host {
            Host {
                tcp: TcpStream::connect(addr).await.unwrap(),
                codec: RelayCodec::new(64),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, message: RelayMessage) {
            let mut out = BytesMut::new();
            self.codec.encode(message, &mut out).unwrap();
            self.tcp.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> RelayMessage {
            loop {
                if let Some(message) = self.codec.decode(&mut self.buf).unwrap() {
                    return message;
                }
                let read = timeout(Duration::from_secs(5), self.tcp.read_buf(&mut self.buf))
                    .await
                    .expect("Server should answer")
                    .unwrap();
                assert_ne!(read, 0, "server closed the connection");
            }
        }
    }

    async fn start(server: &Server) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn wait_for_clients(server: &Server, count: usize) {
        for _ in 0..100 {
            if server.client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, got {}", count, server.client_count());
    }

    #[tokio::test]
    async fn register_response_goes_to_requester() {
        let server = server();
        let addr = start(&server).await;
        let mut a = Host::connect(addr).await;
        let mut b = Host::connect(addr).await;
        wait_for_clients(&server, 2).await;

        b.send(RelayMessage::Packet(Packet::register_request(
            1,
            RegOp::Read16,
            vec![0x200],
        )))
        .await;
        match b.recv().await {
            RelayMessage::Packet(packet) => assert_eq!(packet.payload(), &[0x77]),
            other => panic!("expected Packet, got {:?}", other),
        }

        // The other host only sees what is broadcast afterwards
        server.emit_trace(3, vec![5]);
        match a.recv().await {
            RelayMessage::Packet(packet) => assert_eq!(packet.class(), Some(PacketClass::Trace)),
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn claimed_events_go_to_claimant() {
        let server = server();
        let addr = start(&server).await;
        let mut a = Host::connect(addr).await;
        let mut b = Host::connect(addr).await;
        wait_for_clients(&server, 2).await;

        a.send(RelayMessage::Claim(3)).await;
        // Register round trip to make sure the claim was processed
        a.send(RelayMessage::Packet(Packet::register_request(
            3,
            RegOp::Read16,
            vec![0],
        )))
        .await;
        a.recv().await;

        server.emit_trace(3, vec![1]);
        server.emit_trace(2, vec![2]);
        match a.recv().await {
            RelayMessage::Packet(packet) => assert_eq!(packet.payload(), &[1]),
            other => panic!("expected Packet, got {:?}", other),
        }
        match a.recv().await {
            RelayMessage::Packet(packet) => assert_eq!(packet.payload(), &[2]),
            other => panic!("expected Packet, got {:?}", other),
        }
        match b.recv().await {
            RelayMessage::Packet(packet) => assert_eq!(packet.payload(), &[2]),
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn departed_client_loses_claims() {
        let server = server();
        let addr = start(&server).await;
        let mut a = Host::connect(addr).await;
        wait_for_clients(&server, 1).await;
        a.send(RelayMessage::Claim(2)).await;
        a.send(RelayMessage::Packet(Packet::register_request(
            2,
            RegOp::Read16,
            vec![0],
        )))
        .await;
        a.recv().await;
        drop(a);
        wait_for_clients(&server, 0).await;
        assert!(lock(&server.shared.claims).is_empty());
    }
}
