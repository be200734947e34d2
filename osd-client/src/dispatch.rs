//! Routing of inbound packets.
//!
//! Register responses complete the pending call they belong to. Event and trace
//! packets are handed to the handlers registered for the module that sent them;
//! packets for modules without a handler are dropped.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender},
    },
};

use osd_protocol::{Packet, PacketClass};

use crate::{
    directory::{BusAddr, ModuleIndex, SystemInfo},
    error::{Error, Result},
    transport::PacketSink,
};

/// Callback for event and trace packets. Invoked on the transport's receiver thread.
pub type EventHandler = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Identifies a registered trace handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);

#[derive(Default, Clone)]
struct HandlerRecord {
    packet: Option<EventHandler>,
    trace: Vec<(HandlerId, EventHandler)>,
}

struct PendingCall {
    id: u64,
    addr: BusAddr,
    tx: SyncSender<Packet>,
}

/// A register call waiting for its response.
pub(crate) struct CallTicket {
    pub id: u64,
    pub rx: Receiver<Packet>,
}

/// State shared between callers and the transport's receiver thread.
pub(crate) struct Dispatcher {
    directory: RwLock<Option<Arc<SystemInfo>>>,
    handlers: RwLock<Vec<HandlerRecord>>,
    pending: Mutex<VecDeque<PendingCall>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    debug_trace: bool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    pub fn new(debug_trace: bool) -> Dispatcher {
        Dispatcher {
            directory: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            debug_trace,
        }
    }

    pub fn directory(&self) -> Option<Arc<SystemInfo>> {
        read(&self.directory).clone()
    }

    /// Replaces the module directory.
    ///
    /// Handlers survive for modules that keep their bus address and type,
    /// all others are dropped.
    pub fn install_directory(&self, info: SystemInfo) {
        let mut directory = write(&self.directory);
        let mut handlers = write(&self.handlers);
        let mut records = vec![HandlerRecord::default(); info.modules().len()];
        if let Some(old) = directory.as_ref() {
            for (i, record) in handlers.drain(..).enumerate() {
                match (old.modules().get(i), info.modules().get(i)) {
                    (Some(before), Some(after))
                        if before.addr == after.addr && before.module_type == after.module_type =>
                    {
                        records[i] = record;
                    }
                    _ => {}
                }
            }
        }
        *handlers = records;
        *directory = Some(Arc::new(info));
    }

    // Checked with the handler table locked, `disconnected` clears it after closing
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    fn check_module(&self, index: ModuleIndex) -> Result<()> {
        let directory = read(&self.directory);
        let info = directory.as_ref().ok_or(Error::NotEnumerated)?;
        if index.get() == 0 || info.module(index).is_none() {
            return Err(Error::UnknownModule(index));
        }
        Ok(())
    }

    /// Installs (or with `None` removes) the packet handler of a module, returning the previous one.
    ///
    /// Fails once the dispatcher is closed, so a handler cannot outlive a disconnect.
    pub fn set_packet_handler(
        &self,
        index: ModuleIndex,
        handler: Option<EventHandler>,
    ) -> Result<Option<EventHandler>> {
        self.check_module(index)?;
        let mut handlers = write(&self.handlers);
        self.check_open()?;
        let record = handlers
            .get_mut(index.as_usize())
            .ok_or(Error::UnknownModule(index))?;
        log::debug!(
            "{} packet handler of module {}",
            if handler.is_some() { "Installing" } else { "Removing" },
            index
        );
        Ok(std::mem::replace(&mut record.packet, handler))
    }

    pub fn add_trace_handler(&self, index: ModuleIndex, handler: EventHandler) -> Result<HandlerId> {
        self.check_module(index)?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = write(&self.handlers);
        self.check_open()?;
        handlers
            .get_mut(index.as_usize())
            .ok_or(Error::UnknownModule(index))?
            .trace
            .push((id, handler));
        Ok(id)
    }

    pub fn remove_trace_handler(&self, index: ModuleIndex, id: HandlerId) -> Result<bool> {
        self.check_module(index)?;
        let mut handlers = write(&self.handlers);
        let record = handlers
            .get_mut(index.as_usize())
            .ok_or(Error::UnknownModule(index))?;
        let before = record.trace.len();
        record.trace.retain(|(handler_id, _)| *handler_id != id);
        Ok(record.trace.len() != before)
    }

    /// Queues a register call to `addr`; the response is delivered through the ticket.
    pub fn register_call(&self, addr: BusAddr) -> Result<CallTicket> {
        self.check_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.pending).push_back(PendingCall { id, addr, tx });
        Ok(CallTicket { id, rx })
    }

    /// Withdraws a call. Returns `false` if it was already completed.
    pub fn cancel_call(&self, id: u64) -> bool {
        let mut pending = lock(&self.pending);
        match pending.iter().position(|call| call.id == id) {
            Some(pos) => {
                pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Marks the dispatcher usable again after a reconnect.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn complete_call(&self, packet: Packet) {
        let source = BusAddr::new(packet.class_payload());
        let call = {
            let mut pending = lock(&self.pending);
            // Responses without a source address complete the oldest call
            let pos = if source == BusAddr::HOST {
                if pending.is_empty() { None } else { Some(0) }
            } else {
                pending.iter().position(|call| call.addr == source)
            };
            pos.and_then(|pos| pending.remove(pos))
        };
        match call {
            Some(call) => {
                let _ = call.tx.send(packet);
            }
            None => log::warn!(
                "Dropping register response from {} without a pending request: {}",
                source,
                packet
            ),
        }
    }

    fn dispatch_event(&self, class: PacketClass, packet: Packet) {
        let source = BusAddr::new(packet.class_payload());
        let Some(index) = self.directory().and_then(|info| info.index_of(source)) else {
            log::debug!("Dropping {:?} packet from unknown module {}", class, source);
            return;
        };

        // Longer payloads than the subtype can express declare zero words
        let expected = packet.subtype() as usize;
        if expected != 0 && packet.payload().len() != expected {
            log::warn!(
                "Event from {} declares {} words, carries {}",
                source,
                expected,
                packet.payload().len()
            );
        }

        let targets: Vec<EventHandler> = {
            let handlers = read(&self.handlers);
            match (handlers.get(index.as_usize()), class) {
                (Some(record), PacketClass::Event) => record.packet.iter().cloned().collect(),
                (Some(record), PacketClass::Trace) => {
                    record.trace.iter().map(|(_, h)| h.clone()).collect()
                }
                _ => Vec::new(),
            }
        };
        if targets.is_empty() {
            log::debug!("No {:?} handler for module {}, dropping packet", class, index);
            return;
        }
        for handler in targets {
            handler(&packet);
        }
    }
}

impl PacketSink for Dispatcher {
    fn handle_inbound(&self, packet: Packet) {
        if self.debug_trace {
            log::trace!("rx {}", packet);
        }
        match packet.class() {
            Some(PacketClass::Register) => self.complete_call(packet),
            Some(class) => self.dispatch_event(class, packet),
            None => log::warn!("Dropping packet of reserved class: {}", packet),
        }
    }

    /// Fails all outstanding calls and drops all handlers, which ends pending transfers.
    fn disconnected(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.pending).clear();
        for record in write(&self.handlers).iter_mut() {
            *record = HandlerRecord::default();
        }
        log::debug!("Dispatcher closed");
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::directory::{self, ModuleType, test::FakeRegisters};

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new(true);
        dispatcher.install_directory(directory::enumerate(&FakeRegisters::small_system()).unwrap());
        dispatcher
    }

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (
            count,
            Arc::new(move |_: &Packet| {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn event_reaches_only_packet_handler() {
        let dispatcher = dispatcher();
        let (packets, on_packet) = counter();
        let (traces, on_trace) = counter();
        let module = ModuleIndex::new(3);
        dispatcher.set_packet_handler(module, Some(on_packet)).unwrap();
        dispatcher.add_trace_handler(module, on_trace).unwrap();
        let ticket = dispatcher.register_call(BusAddr::new(3)).unwrap();

        dispatcher.handle_inbound(Packet::event(0, 3, vec![1, 2, 3]));

        assert_eq!(packets.load(Ordering::SeqCst), 1);
        assert_eq!(traces.load(Ordering::SeqCst), 0);
        assert!(ticket.rx.try_recv().is_err());
        assert!(dispatcher.cancel_call(ticket.id));
    }

    #[test]
    fn trace_reaches_all_trace_handlers() {
        let dispatcher = dispatcher();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        let module = ModuleIndex::new(3);
        dispatcher.add_trace_handler(module, on_first).unwrap();
        let id = dispatcher.add_trace_handler(module, on_second).unwrap();

        dispatcher.handle_inbound(Packet::trace(0, 3, vec![0xaa]));
        assert!(dispatcher.remove_trace_handler(module, id).unwrap());
        assert!(!dispatcher.remove_trace_handler(module, id).unwrap());
        dispatcher.handle_inbound(Packet::trace(0, 3, vec![0xbb]));

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_without_handler_are_dropped() {
        let dispatcher = dispatcher();
        let (count, handler) = counter();
        dispatcher.set_packet_handler(ModuleIndex::new(2), Some(handler)).unwrap();
        dispatcher.handle_inbound(Packet::event(0, 3, vec![1]));
        dispatcher.handle_inbound(Packet::event(0, 9, vec![1]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn size_mismatch_is_tolerated() {
        let dispatcher = dispatcher();
        let (count, handler) = counter();
        dispatcher.set_packet_handler(ModuleIndex::new(3), Some(handler)).unwrap();
        // Subtype claims two words, the packet carries four
        let type_field = osd_protocol::type_word(PacketClass::Event, 2, 3);
        dispatcher.handle_inbound(Packet::new(0, type_field, vec![1, 2, 3, 4]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn responses_complete_matching_call() {
        let dispatcher = dispatcher();
        let to_two = dispatcher.register_call(BusAddr::new(2)).unwrap();
        let to_three = dispatcher.register_call(BusAddr::new(3)).unwrap();

        dispatcher.handle_inbound(Packet::register_response(0, 3, vec![0x33]));
        dispatcher.handle_inbound(Packet::register_response(0, 2, vec![0x22]));

        assert_eq!(to_two.rx.try_recv().unwrap().payload(), &[0x22]);
        assert_eq!(to_three.rx.try_recv().unwrap().payload(), &[0x33]);
    }

    #[test]
    fn unattributed_response_completes_oldest_call() {
        let dispatcher = dispatcher();
        let first = dispatcher.register_call(BusAddr::new(5)).unwrap();
        let second = dispatcher.register_call(BusAddr::new(2)).unwrap();
        dispatcher.handle_inbound(Packet::from_words(&[3, 5, 0, 0x1234]).unwrap());
        assert_eq!(first.rx.try_recv().unwrap().payload(), &[0x1234]);
        assert!(second.rx.try_recv().is_err());
    }

    #[test]
    fn stray_response_is_dropped() {
        let dispatcher = dispatcher();
        let call = dispatcher.register_call(BusAddr::new(2)).unwrap();
        dispatcher.handle_inbound(Packet::register_response(0, 3, vec![1]));
        assert!(call.rx.try_recv().is_err());
        assert!(dispatcher.cancel_call(call.id));
        assert!(!dispatcher.cancel_call(call.id));
    }

    #[test]
    fn handlers_need_directory() {
        let dispatcher = Dispatcher::new(false);
        let (_, handler) = counter();
        assert!(matches!(
            dispatcher.set_packet_handler(ModuleIndex::new(1), Some(handler.clone())),
            Err(Error::NotEnumerated)
        ));
        let dispatcher = self::dispatcher();
        assert!(matches!(
            dispatcher.add_trace_handler(ModuleIndex::new(0), handler.clone()),
            Err(Error::UnknownModule(_))
        ));
        assert!(matches!(
            dispatcher.add_trace_handler(ModuleIndex::new(4), handler),
            Err(Error::UnknownModule(_))
        ));
    }

    #[test]
    fn reenumeration_keeps_handlers_of_unchanged_modules() {
        let dispatcher = dispatcher();
        let (memory, on_memory) = counter();
        let (trace, on_trace) = counter();
        dispatcher.set_packet_handler(ModuleIndex::new(2), Some(on_memory)).unwrap();
        dispatcher.add_trace_handler(ModuleIndex::new(3), on_trace).unwrap();

        let mut regs = FakeRegisters::small_system();
        regs.set(3, directory::reg::MOD_TYPE, 5);
        let info = directory::enumerate(&regs).unwrap();
        assert_eq!(info.module(ModuleIndex::new(3)).unwrap().module_type, ModuleType::CoreTrace);
        dispatcher.install_directory(info);

        dispatcher.handle_inbound(Packet::event(0, 2, vec![1]));
        dispatcher.handle_inbound(Packet::trace(0, 3, vec![1]));
        assert_eq!(memory.load(Ordering::SeqCst), 1);
        assert_eq!(trace.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_fails_pending_calls() {
        let dispatcher = dispatcher();
        let call = dispatcher.register_call(BusAddr::new(2)).unwrap();
        dispatcher.disconnected();
        assert!(matches!(
            call.rx.recv(),
            Err(mpsc::RecvError)
        ));
        assert!(matches!(
            dispatcher.register_call(BusAddr::new(2)),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn closed_dispatcher_refuses_handlers() {
        let dispatcher = dispatcher();
        let (count, handler) = counter();
        dispatcher.set_packet_handler(ModuleIndex::new(2), Some(handler.clone())).unwrap();
        dispatcher.disconnected();

        assert!(matches!(
            dispatcher.set_packet_handler(ModuleIndex::new(2), Some(handler.clone())),
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            dispatcher.add_trace_handler(ModuleIndex::new(3), handler.clone()),
            Err(Error::Disconnected)
        ));
        dispatcher.handle_inbound(Packet::event(0, 2, vec![1]));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatcher.reopen();
        dispatcher.set_packet_handler(ModuleIndex::new(2), Some(handler)).unwrap();
        dispatcher.handle_inbound(Packet::event(0, 2, vec![1]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
