//! Discovery of the debug modules of a system.
//!
//! The system control module sits at a fixed bus address and reports how many
//! modules exist. Every module is then asked for its type, type-specific
//! parameters and version.
use std::fmt::Display;

use osd_protocol::{BUS_ADDR_MASK, memory::address_chunks};

use crate::error::{Error, Result};

/// Register addresses used during enumeration and control.
pub mod reg {
    /// Module type, present on every module.
    pub const MOD_TYPE: u16 = 0x0;
    /// Module version, present on every module.
    pub const MOD_VERSION: u16 = 0x1;
    /// Module control and status, used to stall and unstall a module.
    pub const MOD_CS: u16 = 0x3;

    /// System identifier of the control module.
    pub const SCM_SYSTEM_ID: u16 = 0x200;
    /// Number of modules behind the interconnect.
    pub const SCM_NUM_MOD: u16 = 0x201;
    /// Maximum packet length in words.
    pub const SCM_MAX_PKT_LEN: u16 = 0x202;
    /// System control: reset and core halt.
    pub const SCM_SYSRST: u16 = 0x203;

    pub const MAM_DATA_WIDTH: u16 = 0x200;
    pub const MAM_ADDR_WIDTH: u16 = 0x201;
    pub const MAM_REGIONS: u16 = 0x202;
    /// First register of the region table, each region spans [`MAM_REGION_STRIDE`] registers.
    pub const MAM_REGION_BASE: u16 = 0x280;
    pub const MAM_REGION_STRIDE: u16 = 16;
    /// Offset of the region size relative to the region base address registers.
    pub const MAM_REGION_SIZE_OFFSET: u16 = 4;

    pub const STM_VALUE_WIDTH: u16 = 0x200;

    pub const CTM_ADDR_WIDTH: u16 = 0x200;
    pub const CTM_DATA_WIDTH: u16 = 0x201;
}

/// Bus address of the system control module.
pub const SCM_BUS_ADDR: BusAddr = BusAddr(1);

/// Regions beyond this count are not addressable in the register map.
const MAX_REGIONS: u16 = 8;

/// The 10 bit address of a module on the debug interconnect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BusAddr(u16);

impl BusAddr {
    pub const HOST: BusAddr = BusAddr(0);

    pub fn new(addr: u16) -> BusAddr {
        BusAddr(addr & BUS_ADDR_MASK)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl Display for BusAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// Position of a module in the directory. Index 0 is reserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ModuleIndex(u16);

impl ModuleIndex {
    pub fn new(index: u16) -> ModuleIndex {
        ModuleIndex(index)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ModuleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The function of a debug module.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModuleType {
    Host,
    /// System control module.
    Control,
    /// Terminal (UART emulation).
    Terminal,
    /// Memory access module.
    Memory,
    /// Software trace module.
    Trace,
    /// Core trace module.
    CoreTrace,
    Unknown(u16),
}

impl ModuleType {
    pub fn from_code(code: u16) -> ModuleType {
        match code {
            0 => ModuleType::Host,
            1 => ModuleType::Control,
            2 => ModuleType::Terminal,
            3 => ModuleType::Memory,
            4 => ModuleType::Trace,
            5 => ModuleType::CoreTrace,
            other => ModuleType::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            ModuleType::Host => 0,
            ModuleType::Control => 1,
            ModuleType::Terminal => 2,
            ModuleType::Memory => 3,
            ModuleType::Trace => 4,
            ModuleType::CoreTrace => 5,
            ModuleType::Unknown(code) => code,
        }
    }
}

impl Display for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleType::Host => write!(f, "host"),
            ModuleType::Control => write!(f, "control"),
            ModuleType::Terminal => write!(f, "terminal"),
            ModuleType::Memory => write!(f, "memory"),
            ModuleType::Trace => write!(f, "trace"),
            ModuleType::CoreTrace => write!(f, "core-trace"),
            ModuleType::Unknown(code) => write!(f, "unknown({:#06x})", code),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base_addr: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryDescriptor {
    /// Width of the data bus in bits.
    pub data_width: u16,
    /// Width of the address bus in bits.
    pub addr_width: u16,
    pub regions: Vec<MemoryRegion>,
}

impl MemoryDescriptor {
    /// The data bus width in bytes, the unit of every memory transfer.
    pub fn block_size(&self) -> usize {
        self.data_width as usize / 8
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceDescriptor {
    pub value_width: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CoreTraceDescriptor {
    pub addr_width: u16,
    pub data_width: u16,
}

/// Type specific information read during enumeration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModuleExtra {
    None,
    Memory(MemoryDescriptor),
    Trace(TraceDescriptor),
    CoreTrace(CoreTraceDescriptor),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleDescriptor {
    pub index: ModuleIndex,
    pub addr: BusAddr,
    pub module_type: ModuleType,
    pub version: u16,
    pub extra: ModuleExtra,
}

impl ModuleDescriptor {
    pub fn memory(&self) -> Option<&MemoryDescriptor> {
        match &self.extra {
            ModuleExtra::Memory(mem) => Some(mem),
            _ => None,
        }
    }
}

/// The module directory, built once per enumeration and read-only afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SystemInfo {
    identifier: u16,
    max_packet_len: u16,
    memory_count: u16,
    modules: Vec<ModuleDescriptor>,
}

impl SystemInfo {
    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// The largest value of a packet's size word the system accepts.
    pub fn max_packet_len(&self) -> u16 {
        self.max_packet_len
    }

    /// Number of modules, not counting the reserved index 0.
    pub fn module_count(&self) -> u16 {
        (self.modules.len() - 1) as u16
    }

    pub fn memory_count(&self) -> u16 {
        self.memory_count
    }

    /// All descriptors including the reserved entry at index 0.
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn module(&self, index: ModuleIndex) -> Option<&ModuleDescriptor> {
        self.modules.get(index.as_usize())
    }

    pub fn by_bus_addr(&self, addr: BusAddr) -> Option<&ModuleDescriptor> {
        self.index_of(addr).and_then(|index| self.module(index))
    }

    /// Maps a bus address to the module index.
    pub fn index_of(&self, addr: BusAddr) -> Option<ModuleIndex> {
        if addr == BusAddr::HOST {
            return None;
        }
        // Modules are laid out with bus address == index
        match self.modules.get(addr.get() as usize) {
            Some(module) if module.addr == addr => Some(module.index),
            _ => self
                .modules
                .iter()
                .skip(1)
                .find(|m| m.addr == addr)
                .map(|m| m.index),
        }
    }

    pub fn memory_modules(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules_of_type(ModuleType::Memory)
    }

    pub fn modules_of_type(&self, module_type: ModuleType) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules
            .iter()
            .skip(1)
            .filter(move |m| m.module_type == module_type)
    }
}

/// Synchronous 16 bit register access, the only capability enumeration needs.
pub trait RegisterAccess {
    fn read16(&self, addr: BusAddr, reg: u16) -> Result<u16>;
    fn write16(&self, addr: BusAddr, reg: u16, value: u16) -> Result<()>;
}

/// Walks the system control module and all modules it reports.
pub fn enumerate(regs: &impl RegisterAccess) -> Result<SystemInfo> {
    let scm_type = ModuleType::from_code(regs.read16(SCM_BUS_ADDR, reg::MOD_TYPE)?);
    if scm_type != ModuleType::Control {
        return Err(Error::CannotEnumerate(format!(
            "module at {} is of type {}, expected control",
            SCM_BUS_ADDR, scm_type
        )));
    }

    let identifier = regs.read16(SCM_BUS_ADDR, reg::SCM_SYSTEM_ID)?;
    let count = regs.read16(SCM_BUS_ADDR, reg::SCM_NUM_MOD)?;
    let max_packet_len = regs.read16(SCM_BUS_ADDR, reg::SCM_MAX_PKT_LEN)?;
    log::debug!(
        "System {:#06x}: {} modules, max packet length {}",
        identifier,
        count,
        max_packet_len
    );
    if max_packet_len < 3 {
        return Err(Error::CannotEnumerate(format!(
            "max packet length {} is too small",
            max_packet_len
        )));
    }
    if count == 0 || count > BUS_ADDR_MASK {
        return Err(Error::CannotEnumerate(format!(
            "invalid module count {}",
            count
        )));
    }

    let mut modules = Vec::with_capacity(count as usize + 1);
    modules.push(ModuleDescriptor {
        index: ModuleIndex(0),
        addr: BusAddr::HOST,
        module_type: ModuleType::Host,
        version: 0,
        extra: ModuleExtra::None,
    });
    for index in 1..=count {
        let module = describe_module(regs, ModuleIndex(index), BusAddr::new(index))?;
        log::debug!(
            "Module {} at {}: {} v{}",
            module.index,
            module.addr,
            module.module_type,
            module.version
        );
        modules.push(module);
    }

    let memory_count = modules
        .iter()
        .filter(|m| m.module_type == ModuleType::Memory)
        .count() as u16;

    Ok(SystemInfo {
        identifier,
        max_packet_len,
        memory_count,
        modules,
    })
}

fn describe_module(
    regs: &impl RegisterAccess,
    index: ModuleIndex,
    addr: BusAddr,
) -> Result<ModuleDescriptor> {
    let module_type = ModuleType::from_code(regs.read16(addr, reg::MOD_TYPE)?);
    let extra = match module_type {
        ModuleType::Memory => ModuleExtra::Memory(describe_memory(regs, addr)?),
        ModuleType::Trace => ModuleExtra::Trace(TraceDescriptor {
            value_width: regs.read16(addr, reg::STM_VALUE_WIDTH)?,
        }),
        ModuleType::CoreTrace => ModuleExtra::CoreTrace(CoreTraceDescriptor {
            addr_width: regs.read16(addr, reg::CTM_ADDR_WIDTH)?,
            data_width: regs.read16(addr, reg::CTM_DATA_WIDTH)?,
        }),
        _ => ModuleExtra::None,
    };
    let version = regs.read16(addr, reg::MOD_VERSION)?;
    Ok(ModuleDescriptor {
        index,
        addr,
        module_type,
        version,
        extra,
    })
}

fn describe_memory(regs: &impl RegisterAccess, addr: BusAddr) -> Result<MemoryDescriptor> {
    let data_width = regs.read16(addr, reg::MAM_DATA_WIDTH)?;
    let addr_width = regs.read16(addr, reg::MAM_ADDR_WIDTH)?;
    let region_count = regs.read16(addr, reg::MAM_REGIONS)?;
    let chunks = address_chunks(addr_width).map_err(|e| {
        Error::CannotEnumerate(format!("memory module at {}: {}", addr, e))
    })? as u16;
    if region_count > MAX_REGIONS {
        return Err(Error::CannotEnumerate(format!(
            "memory module at {} reports {} regions",
            addr, region_count
        )));
    }

    let read_wide = |first: u16| -> Result<u64> {
        let mut value = 0u64;
        for chunk in 0..chunks {
            value |= u64::from(regs.read16(addr, first + chunk)?) << (16 * chunk);
        }
        Ok(value)
    };

    let mut regions = Vec::with_capacity(region_count as usize);
    for region in 0..region_count {
        let first = reg::MAM_REGION_BASE + reg::MAM_REGION_STRIDE * region;
        regions.push(MemoryRegion {
            base_addr: read_wide(first)?,
            size: read_wide(first + reg::MAM_REGION_SIZE_OFFSET)?,
        });
    }

    Ok(MemoryDescriptor {
        data_width,
        addr_width,
        regions,
    })
}

#[cfg(test)]
pub(crate) mod test {
    use std::{cell::RefCell, collections::HashMap};

    use super::*;

    /// A register file keyed by bus address and register.
    #[derive(Default)]
    pub(crate) struct FakeRegisters {
        pub values: HashMap<(u16, u16), u16>,
        pub reads: RefCell<Vec<(u16, u16)>>,
    }

    impl FakeRegisters {
        pub fn set(&mut self, addr: u16, reg: u16, value: u16) {
            self.values.insert((addr, reg), value);
        }

        /// A control module, a 32 bit memory with one region and a trace module.
        pub fn small_system() -> FakeRegisters {
            let mut regs = FakeRegisters::default();
            regs.set(1, reg::MOD_TYPE, 1);
            regs.set(1, reg::MOD_VERSION, 2);
            regs.set(1, reg::SCM_SYSTEM_ID, 0xabcd);
            regs.set(1, reg::SCM_NUM_MOD, 3);
            regs.set(1, reg::SCM_MAX_PKT_LEN, 12);

            regs.set(2, reg::MOD_TYPE, 3);
            regs.set(2, reg::MOD_VERSION, 1);
            regs.set(2, reg::MAM_DATA_WIDTH, 32);
            regs.set(2, reg::MAM_ADDR_WIDTH, 32);
            regs.set(2, reg::MAM_REGIONS, 1);
            regs.set(2, 0x280, 0x0000);
            regs.set(2, 0x281, 0x8000);
            regs.set(2, 0x284, 0x0000);
            regs.set(2, 0x285, 0x0001);

            regs.set(3, reg::MOD_TYPE, 4);
            regs.set(3, reg::MOD_VERSION, 0);
            regs.set(3, reg::STM_VALUE_WIDTH, 16);
            regs
        }
    }

    impl RegisterAccess for FakeRegisters {
        fn read16(&self, addr: BusAddr, reg: u16) -> Result<u16> {
            self.reads.borrow_mut().push((addr.get(), reg));
            Ok(self.values.get(&(addr.get(), reg)).copied().unwrap_or(0))
        }

        fn write16(&self, _addr: BusAddr, _reg: u16, _value: u16) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn enumerate_small_system() {
        let info = enumerate(&FakeRegisters::small_system()).unwrap();
        assert_eq!(info.identifier(), 0xabcd);
        assert_eq!(info.module_count(), 3);
        assert_eq!(info.max_packet_len(), 12);
        assert_eq!(info.memory_count(), 1);

        let host = info.module(ModuleIndex::new(0)).unwrap();
        assert_eq!(host.module_type, ModuleType::Host);
        assert_eq!(host.addr, BusAddr::HOST);

        let mem = info.module(ModuleIndex::new(2)).unwrap();
        assert_eq!(mem.addr, BusAddr::new(2));
        assert_eq!(mem.version, 1);
        let desc = mem.memory().unwrap();
        assert_eq!(desc.block_size(), 4);
        assert_eq!(
            desc.regions,
            vec![MemoryRegion {
                base_addr: 0x8000_0000,
                size: 0x1_0000
            }]
        );

        let stm = info.module(ModuleIndex::new(3)).unwrap();
        assert_eq!(stm.extra, ModuleExtra::Trace(TraceDescriptor { value_width: 16 }));
        assert_eq!(info.memory_modules().count(), 1);
    }

    #[test]
    fn version_is_read_after_type_specific_registers() {
        let regs = FakeRegisters::small_system();
        enumerate(&regs).unwrap();
        let reads = regs.reads.borrow();
        let module2: Vec<u16> = reads.iter().filter(|(a, _)| *a == 2).map(|(_, r)| *r).collect();
        assert_eq!(module2.first(), Some(&reg::MOD_TYPE));
        assert_eq!(module2.last(), Some(&reg::MOD_VERSION));
    }

    #[test]
    fn wrong_control_module_type() {
        let mut regs = FakeRegisters::small_system();
        regs.set(1, reg::MOD_TYPE, 3);
        match enumerate(&regs) {
            Err(Error::CannotEnumerate(_)) => {}
            other => panic!("expected CannotEnumerate, got {:?}", other),
        }
        // Nothing beyond the type register was touched
        assert_eq!(regs.reads.borrow().len(), 1);
    }

    #[test]
    fn reject_tiny_packet_length() {
        let mut regs = FakeRegisters::small_system();
        regs.set(1, reg::SCM_MAX_PKT_LEN, 2);
        assert!(matches!(enumerate(&regs), Err(Error::CannotEnumerate(_))));
    }

    #[test]
    fn wide_memory_addresses() {
        let mut regs = FakeRegisters::small_system();
        regs.set(2, reg::MAM_ADDR_WIDTH, 64);
        regs.set(2, 0x283, 0x0011);
        regs.set(2, 0x287, 0x0002);
        let info = enumerate(&regs).unwrap();
        let region = info.module(ModuleIndex::new(2)).unwrap().memory().unwrap().regions[0];
        assert_eq!(region.base_addr, 0x0011_0000_8000_0000);
        assert_eq!(region.size, 0x0002_0000_0001_0000);
    }

    #[test]
    fn bus_address_lookup() {
        let info = enumerate(&FakeRegisters::small_system()).unwrap();
        assert_eq!(info.index_of(BusAddr::new(3)), Some(ModuleIndex::new(3)));
        assert_eq!(info.index_of(BusAddr::new(4)), None);
        assert_eq!(info.index_of(BusAddr::HOST), None);
        assert_eq!(
            info.by_bus_addr(BusAddr::new(1)).unwrap().module_type,
            ModuleType::Control
        );
    }
}
