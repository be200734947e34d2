//! Simulated module types.
use std::sync::{Arc, Mutex, PoisonError};

use osd_client::{ModuleType, directory::reg};
use osd_protocol::{
    HOST_BUS_ADDR, Packet,
    memory::{MemoryOp, bytes_to_words, decode_address, words_to_bytes},
};

use crate::SimModule;

/// The system control module, always at bus address 1.
///
/// The module count register is answered by the system that owns the module.
#[derive(Debug)]
pub struct ControlModule {
    system_id: u16,
    max_packet_len: u16,
    sysrst: u16,
}

impl ControlModule {
    pub fn new(system_id: u16, max_packet_len: u16) -> ControlModule {
        ControlModule {
            system_id,
            max_packet_len,
            sysrst: 0,
        }
    }
}

impl SimModule for ControlModule {
    fn module_type(&self) -> ModuleType {
        ModuleType::Control
    }

    fn read_register(&self, reg: u16) -> Option<u16> {
        match reg {
            reg::SCM_SYSTEM_ID => Some(self.system_id),
            reg::SCM_MAX_PKT_LEN => Some(self.max_packet_len),
            reg::SCM_SYSRST => Some(self.sysrst),
            _ => None,
        }
    }

    fn write_register(&mut self, reg: u16, value: u16) -> bool {
        if reg != reg::SCM_SYSRST {
            return false;
        }
        log::info!("System control set to {:#x}", value);
        self.sysrst = value;
        true
    }
}

/// Memory shared between a [`MemoryModule`] and whoever inspects it.
pub type Storage = Arc<Mutex<Vec<u8>>>;

struct BulkWrite {
    addr: u64,
    remaining: usize,
}

/// A memory access module in front of a single region of RAM.
pub struct MemoryModule {
    data_width: u16,
    addr_width: u16,
    base_addr: u64,
    storage: Storage,
    pending_write: Option<BulkWrite>,
}

impl MemoryModule {
    /// Creates a module with `size` bytes of zeroed memory at `base_addr`.
    ///
    /// # Panics
    ///
    /// If the data width is not a positive multiple of 16 bits or the address width is
    /// not between 1 and 64 bits.
    pub fn new(data_width: u16, addr_width: u16, base_addr: u64, size: usize) -> MemoryModule {
        assert!(
            data_width > 0 && data_width % 16 == 0,
            "data width must be a multiple of 16 bits, got {}",
            data_width
        );
        assert!(
            (1..=64).contains(&addr_width),
            "address width must be between 1 and 64 bits, got {}",
            addr_width
        );
        MemoryModule {
            data_width,
            addr_width,
            base_addr,
            storage: Arc::new(Mutex::new(vec![0; size])),
            pending_write: None,
        }
    }

    /// Handle to the simulated memory.
    pub fn storage(&self) -> Storage {
        self.storage.clone()
    }

    fn block_size(&self) -> usize {
        self.data_width as usize / 8
    }

    fn address_chunks(&self) -> usize {
        self.addr_width.div_ceil(16) as usize
    }

    fn size(&self) -> u64 {
        self.storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64
    }

    /// Offset into the storage, if `len` bytes at `addr` are backed by it.
    fn offset(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base_addr)?;
        (offset.checked_add(len as u64)? <= self.size()).then_some(offset as usize)
    }

    fn write(&self, addr: u64, data: &[u8], strobe: Option<u16>) {
        let Some(offset) = self.offset(addr, data.len()) else {
            log::warn!("Write of {} bytes at {:#x} is out of range", data.len(), addr);
            return;
        };
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        for (i, byte) in data.iter().enumerate() {
            if strobe.is_none_or(|strobe| strobe & (1 << i) != 0) {
                storage[offset + i] = *byte;
            }
        }
    }

    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let Some(offset) = self.offset(addr, len) else {
            log::warn!("Read of {} bytes at {:#x} is out of range", len, addr);
            return vec![0; len];
        };
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        storage[offset..offset + len].to_vec()
    }

    fn continue_bulk_write(&mut self, write: BulkWrite, words: &[u16]) {
        let words = &words[..words.len().min(write.remaining)];
        let bytes = words_to_bytes(words);
        self.write(write.addr, &bytes, None);
        let remaining = write.remaining - words.len();
        if remaining > 0 {
            self.pending_write = Some(BulkWrite {
                addr: write.addr + bytes.len() as u64,
                remaining,
            });
        } else {
            log::debug!("Bulk write complete");
        }
    }
}

impl SimModule for MemoryModule {
    fn module_type(&self) -> ModuleType {
        ModuleType::Memory
    }

    fn read_register(&self, reg: u16) -> Option<u16> {
        let region_word = |first: u16, value: u64| {
            (first..first + 4)
                .contains(&reg)
                .then(|| (value >> (16 * (reg - first))) as u16)
        };
        match reg {
            reg::MAM_DATA_WIDTH => Some(self.data_width),
            reg::MAM_ADDR_WIDTH => Some(self.addr_width),
            reg::MAM_REGIONS => Some(1),
            _ => region_word(reg::MAM_REGION_BASE, self.base_addr).or_else(|| {
                region_word(
                    reg::MAM_REGION_BASE + reg::MAM_REGION_SIZE_OFFSET,
                    self.size(),
                )
            }),
        }
    }

    fn handle_event(&mut self, bus_addr: u16, packet: &Packet, max_payload: usize) -> Vec<Packet> {
        let payload = packet.payload();
        if let Some(write) = self.pending_write.take() {
            self.continue_bulk_write(write, payload);
            return Vec::new();
        }

        let Some((&tag, rest)) = payload.split_first() else {
            log::warn!("Empty memory request on module {}", bus_addr);
            return Vec::new();
        };
        let op = match MemoryOp::from_word(tag) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Module {}: {}", bus_addr, e);
                return Vec::new();
            }
        };
        if rest.len() < self.address_chunks() {
            log::warn!("Memory request on module {} lacks its address", bus_addr);
            return Vec::new();
        }
        let (addr, data) = rest.split_at(self.address_chunks());
        let addr = decode_address(addr);

        match op {
            MemoryOp::Write { strobe } => {
                log::debug!("Single write at {:#x}, strobe {:#x}", addr, strobe);
                let block = words_to_bytes(data);
                let len = block.len().min(self.block_size());
                self.write(addr, &block[..len], Some(strobe));
                Vec::new()
            }
            MemoryOp::WriteBulk { words } => {
                log::debug!("Bulk write of {} words at {:#x}", words, addr);
                if words > 0 {
                    self.pending_write = Some(BulkWrite {
                        addr,
                        remaining: words as usize,
                    });
                }
                Vec::new()
            }
            MemoryOp::ReadBulk { words } => {
                log::debug!("Bulk read of {} words at {:#x}", words, addr);
                let data = bytes_to_words(&self.read(addr, 2 * words as usize));
                data.chunks(max_payload.max(1))
                    .map(|chunk| Packet::event(HOST_BUS_ADDR, bus_addr, chunk.to_vec()))
                    .collect()
            }
        }
    }
}

/// A software trace module.
#[derive(Debug)]
pub struct TraceModule {
    value_width: u16,
}

impl TraceModule {
    pub fn new(value_width: u16) -> TraceModule {
        TraceModule { value_width }
    }
}

impl SimModule for TraceModule {
    fn module_type(&self) -> ModuleType {
        ModuleType::Trace
    }

    fn read_register(&self, reg: u16) -> Option<u16> {
        (reg == reg::STM_VALUE_WIDTH).then_some(self.value_width)
    }
}

/// A core trace module.
#[derive(Debug)]
pub struct CoreTraceModule {
    addr_width: u16,
    data_width: u16,
}

impl CoreTraceModule {
    pub fn new(addr_width: u16, data_width: u16) -> CoreTraceModule {
        CoreTraceModule {
            addr_width,
            data_width,
        }
    }
}

impl SimModule for CoreTraceModule {
    fn module_type(&self) -> ModuleType {
        ModuleType::CoreTrace
    }

    fn read_register(&self, reg: u16) -> Option<u16> {
        match reg {
            reg::CTM_ADDR_WIDTH => Some(self.addr_width),
            reg::CTM_DATA_WIDTH => Some(self.data_width),
            _ => None,
        }
    }
}
