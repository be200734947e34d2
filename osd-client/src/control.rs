//! System and module control.
use crate::{
    context::Context,
    directory::{BusAddr, ModuleIndex, SCM_BUS_ADDR, reg},
    error::Result,
};

/// Values of the system control register.
pub mod sysrst {
    /// Reset the system and halt all cores.
    pub const HALT_ALL: u16 = 0x3;
    /// Release the system reset, keep the cores halted.
    pub const HALT_CORES: u16 = 0x2;
    /// Run everything.
    pub const RUN: u16 = 0x0;
}

/// Module control bit patterns.
pub mod cs {
    pub const STALL: u16 = 1 << 11 | 1;
    pub const UNSTALL: u16 = 1 << 11;
}

impl Context {
    /// Resets the system. With `halt` the cores stay halted until [`Context::start_cores`].
    pub fn reset(&self, halt: bool) -> Result<()> {
        log::info!("Resetting system{}", if halt { ", cores halted" } else { "" });
        self.write16(SCM_BUS_ADDR, reg::SCM_SYSRST, sysrst::HALT_ALL)?;
        let release = if halt { sysrst::HALT_CORES } else { sysrst::RUN };
        self.write16(SCM_BUS_ADDR, reg::SCM_SYSRST, release)
    }

    pub fn start_cores(&self) -> Result<()> {
        log::info!("Starting cores");
        self.write16(SCM_BUS_ADDR, reg::SCM_SYSRST, sysrst::RUN)
    }

    pub fn stall(&self, module: ModuleIndex) -> Result<()> {
        let addr = self.bus_addr(module)?;
        log::debug!("Stalling module {}", addr);
        self.write16(addr, reg::MOD_CS, cs::STALL)
    }

    pub fn unstall(&self, module: ModuleIndex) -> Result<()> {
        let addr = self.bus_addr(module)?;
        log::debug!("Unstalling module {}", addr);
        self.write16(addr, reg::MOD_CS, cs::UNSTALL)
    }

    /// Asks the transport for exclusive delivery of the events of a module.
    pub fn claim(&self, module: ModuleIndex) -> Result<()> {
        let addr = self.bus_addr(module)?;
        log::debug!("Claiming module {}", addr);
        Ok(self.transport.claim(addr)?)
    }

    pub fn release(&self, module: ModuleIndex) -> Result<()> {
        let addr = self.bus_addr(module)?;
        Ok(self.transport.release(addr)?)
    }

    fn bus_addr(&self, module: ModuleIndex) -> Result<BusAddr> {
        Ok(self.module(module)?.addr)
    }
}
