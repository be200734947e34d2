use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use osd_protocol::Packet;

use crate::{
    directory::{self, ModuleDescriptor, ModuleIndex, SystemInfo},
    dispatch::{Dispatcher, EventHandler, HandlerId},
    error::{Error, Result},
    transport::{PacketSink, Transport},
};

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// How long a register or memory request waits for its response.
    /// `None` waits forever.
    pub rpc_timeout: Option<Duration>,
    /// Log every packet sent and received at trace level.
    pub debug_trace: bool,
}

/// Builder to create a [Context] and modify configuration options
///
/// # Example
///
/// ```ignore
/// use osd_client::Builder;
/// use std::time::Duration;
///
/// let ctx = Builder::new()
///     .rpc_timeout(Duration::from_secs(1))
///     .debug_trace(true)
///     .build(transport);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Fail requests that see no response within `timeout`.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = Some(timeout);
        self
    }

    pub fn debug_trace(mut self, enabled: bool) -> Self {
        self.config.debug_trace = enabled;
        self
    }

    /// Build and return the context
    pub fn build(self, transport: impl Transport + 'static) -> Context {
        Context::with_config(transport, self.config)
    }
}

/// Root handle to one debug system.
///
/// The context owns the transport, the module directory and the handler table.
/// All methods take `&self`; a context can be shared between threads.
pub struct Context {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) config: Config,
    transfer_locks: Mutex<HashMap<ModuleIndex, Arc<Mutex<()>>>>,
}

impl Context {
    pub fn new(transport: impl Transport + 'static) -> Context {
        Context::with_config(transport, Config::default())
    }

    pub fn with_config(transport: impl Transport + 'static, config: Config) -> Context {
        Context {
            transport: Box::new(transport),
            dispatcher: Arc::new(Dispatcher::new(config.debug_trace)),
            config,
            transfer_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens the transport and enumerates the system.
    pub fn connect(&self) -> Result<()> {
        self.dispatcher.reopen();
        self.transport
            .connect(self.dispatcher.clone() as Arc<dyn PacketSink>)?;
        log::info!("Connected, enumerating debug system");
        self.enumerate()
    }

    /// Closes the transport. Outstanding requests fail and all handlers are dropped.
    pub fn disconnect(&self) -> Result<()> {
        self.transport.disconnect()?;
        self.dispatcher.disconnected();
        Ok(())
    }

    /// (Re-)builds the module directory.
    ///
    /// On failure the previous directory stays installed. On success it is replaced;
    /// handlers of modules whose bus address and type did not change are kept.
    pub fn enumerate(&self) -> Result<()> {
        let info = directory::enumerate(self)?;
        log::info!(
            "Enumerated system {:#06x}: {} modules ({} memories), max packet length {}",
            info.identifier(),
            info.module_count(),
            info.memory_count(),
            info.max_packet_len()
        );
        self.dispatcher.install_directory(info);
        Ok(())
    }

    /// The module directory, if the system was enumerated.
    pub fn system_info(&self) -> Option<Arc<SystemInfo>> {
        self.dispatcher.directory()
    }

    pub(crate) fn directory(&self) -> Result<Arc<SystemInfo>> {
        self.system_info().ok_or(Error::NotEnumerated)
    }

    pub fn module(&self, index: ModuleIndex) -> Result<ModuleDescriptor> {
        self.directory()?
            .module(index)
            .cloned()
            .ok_or(Error::UnknownModule(index))
    }

    /// Entry point for inbound packets of transports that are not driven by the context.
    pub fn handle_inbound(&self, packet: Packet) {
        self.dispatcher.handle_inbound(packet)
    }

    /// Sends a packet without waiting for any response.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.config.debug_trace {
            log::trace!("tx {}", packet);
        }
        Ok(self.transport.send(packet)?)
    }

    /// Installs the handler for data event packets of a module, returning the previous one.
    pub fn register_packet_handler(
        &self,
        module: ModuleIndex,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) -> Result<Option<EventHandler>> {
        self.dispatcher
            .set_packet_handler(module, Some(Arc::new(handler)))
    }

    pub fn unregister_packet_handler(&self, module: ModuleIndex) -> Result<Option<EventHandler>> {
        self.dispatcher.set_packet_handler(module, None)
    }

    /// Adds a handler for trace packets of a module. Every trace handler of a module
    /// sees every trace packet.
    pub fn register_trace_handler(
        &self,
        module: ModuleIndex,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.dispatcher.add_trace_handler(module, Arc::new(handler))
    }

    pub fn unregister_trace_handler(&self, module: ModuleIndex, id: HandlerId) -> Result<bool> {
        self.dispatcher.remove_trace_handler(module, id)
    }

    /// Serializes memory transfers to one module.
    pub(crate) fn transfer_lock(&self, module: ModuleIndex) -> Arc<Mutex<()>> {
        self.transfer_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(module)
            .or_default()
            .clone()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.transport.disconnect() {
            log::debug!("Error while closing transport: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        directory::{BusAddr, ModuleType, reg, test::FakeRegisters},
        transport::mock::MockTransport,
    };

    #[test]
    fn connect_enumerates() {
        let mock = MockTransport::new(FakeRegisters::small_system().values);
        let ctx = Context::new(mock.clone());
        ctx.connect().unwrap();
        let info = ctx.system_info().unwrap();
        assert_eq!(info.module_count(), 3);
        assert_eq!(
            ctx.module(ModuleIndex::new(2)).unwrap().module_type,
            ModuleType::Memory
        );
    }

    #[test]
    fn failed_enumeration_installs_nothing() {
        let mut regs = FakeRegisters::small_system();
        regs.set(1, reg::MOD_TYPE, 2);
        let ctx = Context::new(MockTransport::new(regs.values));
        match ctx.connect() {
            Err(Error::CannotEnumerate(_)) => {}
            other => panic!("expected CannotEnumerate, got {:?}", other),
        }
        assert!(ctx.system_info().is_none());
        assert!(matches!(
            ctx.module(ModuleIndex::new(1)),
            Err(Error::NotEnumerated)
        ));
    }

    #[test]
    fn reenumeration_replaces_directory() {
        let mock = MockTransport::new(FakeRegisters::small_system().values);
        let ctx = Context::new(mock.clone());
        ctx.connect().unwrap();
        let before = ctx.system_info().unwrap();

        mock.registers.lock().unwrap().insert((1, reg::SCM_SYSTEM_ID), 0x1111);
        ctx.enumerate().unwrap();
        let after = ctx.system_info().unwrap();

        assert_eq!(before.identifier(), 0xabcd);
        assert_eq!(after.identifier(), 0x1111);
        assert_eq!(before.modules().len(), after.modules().len());
    }

    #[test]
    fn failed_reenumeration_keeps_previous_directory() {
        let mock = MockTransport::new(FakeRegisters::small_system().values);
        let ctx = Context::new(mock.clone());
        ctx.connect().unwrap();

        mock.registers.lock().unwrap().insert((1, reg::MOD_TYPE), 4);
        assert!(matches!(ctx.enumerate(), Err(Error::CannotEnumerate(_))));
        let info = ctx.system_info().unwrap();
        assert_eq!(info.identifier(), 0xabcd);
        assert_eq!(
            info.by_bus_addr(BusAddr::new(1)).unwrap().module_type,
            ModuleType::Control
        );
    }

    #[test]
    fn handler_registration_after_enumeration() {
        let ctx = Context::new(MockTransport::new(FakeRegisters::small_system().values));
        assert!(matches!(
            ctx.register_packet_handler(ModuleIndex::new(2), |_| {}),
            Err(Error::NotEnumerated)
        ));
        ctx.connect().unwrap();
        assert!(
            ctx.register_packet_handler(ModuleIndex::new(2), |_| {})
                .unwrap()
                .is_none()
        );
        assert!(ctx.unregister_packet_handler(ModuleIndex::new(2)).unwrap().is_some());
    }

    #[test]
    fn disconnect_rejects_requests() {
        let ctx = Context::new(MockTransport::new(FakeRegisters::small_system().values));
        ctx.connect().unwrap();
        ctx.disconnect().unwrap();
        assert!(matches!(
            ctx.read16(BusAddr::new(1), reg::MOD_TYPE),
            Err(Error::Disconnected)
        ));
    }
}
