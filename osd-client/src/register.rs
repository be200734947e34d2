//! Synchronous register access.
//!
//! Each request gets its own response channel, queued under the bus address of the
//! module it targets. Calls from several threads may be outstanding at once.
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use osd_protocol::{Packet, RegOp};

use crate::{
    context::Context,
    directory::{BusAddr, RegisterAccess},
    error::{Error, Result},
};

impl Context {
    /// Sends a register request and blocks until its response arrives.
    ///
    /// Without a configured RPC timeout a lost response blocks the caller forever.
    pub fn reg_access(&self, request: Packet) -> Result<Packet> {
        let addr = BusAddr::new(request.dest());
        let ticket = self.dispatcher.register_call(addr)?;
        if let Err(e) = self.send(&request) {
            self.dispatcher.cancel_call(ticket.id);
            return Err(e);
        }

        match wait(&ticket.rx, self.config.rpc_timeout, addr) {
            Err(Error::Timeout { .. }) if !self.dispatcher.cancel_call(ticket.id) => {
                // The response raced the timeout
                ticket.rx.try_recv().map_err(|_| Error::Disconnected)
            }
            other => other,
        }
    }

    pub fn read16(&self, addr: BusAddr, reg: u16) -> Result<u16> {
        let response =
            self.reg_access(Packet::register_request(addr.get(), RegOp::Read16, vec![reg]))?;
        match response.payload() {
            [value] => {
                log::trace!("read16 {}:{:#06x} = {:#06x}", addr, reg, value);
                Ok(*value)
            }
            other => Err(Error::Protocol(format!(
                "read16 response from {} carries {} trailing words, expected 3",
                addr,
                other.len() + 2
            ))),
        }
    }

    pub fn write16(&self, addr: BusAddr, reg: u16, value: u16) -> Result<()> {
        log::trace!("write16 {}:{:#06x} = {:#06x}", addr, reg, value);
        self.reg_access(Packet::register_request(
            addr.get(),
            RegOp::Write16,
            vec![reg, value],
        ))?;
        Ok(())
    }
}

impl RegisterAccess for Context {
    fn read16(&self, addr: BusAddr, reg: u16) -> Result<u16> {
        Context::read16(self, addr, reg)
    }

    fn write16(&self, addr: BusAddr, reg: u16, value: u16) -> Result<()> {
        Context::write16(self, addr, reg, value)
    }
}

/// Waits for the next message of a request, honouring the optional timeout.
pub(crate) fn wait<T>(rx: &Receiver<T>, timeout: Option<Duration>, addr: BusAddr) -> Result<T> {
    match timeout {
        None => rx.recv().map_err(|_| Error::Disconnected),
        Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout { bus: addr, timeout },
            RecvTimeoutError::Disconnected => Error::Disconnected,
        }),
    }
}
