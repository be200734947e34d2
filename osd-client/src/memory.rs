//! Memory access through memory modules.
//!
//! Transfers are split into an unaligned prolog, a block aligned bulk part and an
//! unaligned epilog. Prolog and epilog are moved one block at a time (strobed writes,
//! full block reads). The bulk part is moved in transfers of at most
//! [`MAX_TRANSFER_BYTES`], each a header packet followed by as many data packets
//! as the negotiated packet length requires.
use std::sync::{Arc, PoisonError, mpsc};

use osd_protocol::{
    HOST_BUS_ADDR, Packet,
    memory::{
        MAX_TRANSFER_BYTES, MemoryOp, address_chunks, bytes_to_words, header_payload,
        words_to_bytes,
    },
};

use crate::{
    context::Context,
    directory::{BusAddr, ModuleIndex},
    dispatch::EventHandler,
    error::{Error, Result},
    register::wait,
};

/// The three parts of a memory transfer, in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Parts {
    pub prolog: usize,
    pub bulk: usize,
    pub epilog: usize,
}

/// Splits `size` bytes at `addr` into an unaligned prolog, aligned bulk and unaligned epilog.
///
/// A transfer smaller than one block is all prolog.
pub fn calculate_parts(addr: u64, size: usize, block_size: usize) -> Parts {
    if size < block_size {
        return Parts {
            prolog: size,
            bulk: 0,
            epilog: 0,
        };
    }
    let block = block_size as u64;
    let offset = addr % block;
    let prolog = ((block - offset) % block) as usize;
    let epilog = ((offset + (size % block_size) as u64) % block) as usize;
    Parts {
        prolog,
        bulk: size - prolog - epilog,
        epilog,
    }
}

/// Everything needed to address one memory module.
#[derive(Copy, Clone, Debug)]
struct Target {
    index: ModuleIndex,
    addr: BusAddr,
    block_size: usize,
    addr_width: u16,
    /// Payload words that fit into one packet.
    max_payload: usize,
}

impl Target {
    fn block_base(&self, addr: u64) -> u64 {
        addr - addr % self.block_size as u64
    }

    /// Fails unless all `size` bytes at `addr` lie within the module's address space.
    fn check_range(&self, addr: u64, size: usize) -> Result<()> {
        let end = addr.checked_add(size as u64);
        let fits = match end {
            Some(end) => self.addr_width >= 64 || end <= 1u64 << self.addr_width,
            None => false,
        };
        if !fits {
            return Err(Error::Protocol(format!(
                "{} bytes at {:#x} exceed the {} bit address space of module {}",
                size, addr, self.addr_width, self.index
            )));
        }
        Ok(())
    }
}

/// Restores the packet handler and releases the claim of a module after a read.
struct ReadGuard<'a> {
    ctx: &'a Context,
    target: Target,
    previous: Option<EventHandler>,
    installed: bool,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.installed {
            let previous = self.previous.take();
            if let Err(e) = self.ctx.dispatcher.set_packet_handler(self.target.index, previous) {
                log::debug!("Could not restore handler of module {}: {}", self.target.index, e);
            }
        }
        if let Err(e) = self.ctx.transport.release(self.target.addr) {
            log::warn!("Could not release module {}: {}", self.target.addr, e);
        }
    }
}

impl Context {
    fn memory_target(&self, module: ModuleIndex) -> Result<Target> {
        let info = self.directory()?;
        let desc = info.module(module).ok_or(Error::UnknownModule(module))?;
        let mem = desc.memory().ok_or(Error::NotMemoryModule(module))?;

        let block_size = mem.block_size();
        // Blocks are moved as whole words and strobes have 14 bits
        if mem.data_width % 16 != 0 || block_size == 0 || block_size > 14 {
            return Err(Error::Protocol(format!(
                "unsupported data width of {} bits on module {}",
                mem.data_width, module
            )));
        }
        let max_payload = info.max_packet_len() as usize - 2;
        let single_write = 1 + address_chunks(mem.addr_width)? + block_size / 2;
        if single_write > max_payload {
            return Err(Error::Protocol(format!(
                "single block write of {} words exceeds the packet limit of {}",
                single_write, max_payload
            )));
        }
        Ok(Target {
            index: module,
            addr: desc.addr,
            block_size,
            addr_width: mem.addr_width,
            max_payload,
        })
    }

    /// Writes `data` to memory starting at byte address `addr`.
    pub fn memory_write(&self, module: ModuleIndex, addr: u64, data: &[u8]) -> Result<()> {
        let target = self.memory_target(module)?;
        let lock = self.transfer_lock(module);
        let _transfer = lock.lock().unwrap_or_else(PoisonError::into_inner);

        target.check_range(addr, data.len())?;
        let parts = calculate_parts(addr, data.len(), target.block_size);
        log::debug!(
            "Memory write of {} bytes at {:#x} on module {}: {:?}",
            data.len(),
            addr,
            module,
            parts
        );
        let (prolog, rest) = data.split_at(parts.prolog);
        let (bulk, epilog) = rest.split_at(parts.bulk);

        if !prolog.is_empty() {
            self.write_unaligned(&target, addr, prolog)?;
        }
        if !bulk.is_empty() {
            self.write_bulk(&target, addr + parts.prolog as u64, bulk)?;
        }
        if !epilog.is_empty() {
            self.write_unaligned(&target, addr + (parts.prolog + parts.bulk) as u64, epilog)?;
        }
        Ok(())
    }

    /// Reads `size` bytes of memory starting at byte address `addr`.
    pub fn memory_read(&self, module: ModuleIndex, addr: u64, size: usize) -> Result<Vec<u8>> {
        let target = self.memory_target(module)?;
        let lock = self.transfer_lock(module);
        let _transfer = lock.lock().unwrap_or_else(PoisonError::into_inner);

        target.check_range(addr, size)?;
        let parts = calculate_parts(addr, size, target.block_size);
        log::debug!(
            "Memory read of {} bytes at {:#x} on module {}: {:?}",
            size,
            addr,
            module,
            parts
        );
        let mut data = Vec::with_capacity(size);
        if parts.prolog > 0 {
            data.extend(self.read_unaligned(&target, addr, parts.prolog)?);
        }
        if parts.bulk > 0 {
            data.extend(self.read_bulk(&target, addr + parts.prolog as u64, parts.bulk)?);
        }
        if parts.epilog > 0 {
            let epilog_addr = addr + (parts.prolog + parts.bulk) as u64;
            data.extend(self.read_unaligned(&target, epilog_addr, parts.epilog)?);
        }
        Ok(data)
    }

    /// One strobed write per block touched by `data`.
    fn write_unaligned(&self, target: &Target, addr: u64, data: &[u8]) -> Result<()> {
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let base = target.block_base(addr);
            let offset = (addr - base) as usize;
            let len = data.len().min(target.block_size - offset);
            self.write_single(target, base, offset, &data[..len])?;
            addr += len as u64;
            data = &data[len..];
        }
        Ok(())
    }

    /// Writes `data` at `offset` within the block at `base`, leaving the other bytes untouched.
    fn write_single(&self, target: &Target, base: u64, offset: usize, data: &[u8]) -> Result<()> {
        let strobe = (((1u32 << data.len()) - 1) << offset) as u16;
        let mut block = vec![0u8; target.block_size];
        block[offset..offset + data.len()].copy_from_slice(data);

        let mut payload = header_payload(MemoryOp::Write { strobe }, base, target.addr_width)?;
        payload.extend(bytes_to_words(&block));
        log::trace!(
            "Strobed write at {:#x}, strobe {:#06b}",
            base,
            strobe
        );
        self.send(&Packet::event(target.addr.get(), HOST_BUS_ADDR, payload))
    }

    fn write_bulk(&self, target: &Target, addr: u64, data: &[u8]) -> Result<()> {
        for (i, transfer) in data.chunks(MAX_TRANSFER_BYTES).enumerate() {
            let transfer_addr = addr + (i * MAX_TRANSFER_BYTES) as u64;
            let words = bytes_to_words(transfer);
            let header = header_payload(
                MemoryOp::WriteBulk {
                    words: words.len() as u16,
                },
                transfer_addr,
                target.addr_width,
            )?;
            self.send(&Packet::event(target.addr.get(), HOST_BUS_ADDR, header))?;
            for chunk in words.chunks(target.max_payload) {
                self.send(&Packet::event(
                    target.addr.get(),
                    HOST_BUS_ADDR,
                    chunk.to_vec(),
                ))?;
            }
        }
        Ok(())
    }

    /// Reads whole blocks and slices out the requested bytes.
    fn read_unaligned(&self, target: &Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let base = target.block_base(addr);
        let offset = (addr - base) as usize;
        let len = (offset + size).div_ceil(target.block_size) * target.block_size;
        let blocks = self.read_bulk(target, base, len)?;
        Ok(blocks[offset..offset + size].to_vec())
    }

    /// Reads block aligned memory. The module is claimed and its packet handler replaced
    /// for the duration of the read.
    fn read_bulk(&self, target: &Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let (tx, rx) = mpsc::channel::<Vec<u16>>();

        self.transport.claim(target.addr)?;
        let mut guard = ReadGuard {
            ctx: self,
            target: *target,
            previous: None,
            installed: false,
        };
        guard.previous = self.dispatcher.set_packet_handler(
            target.index,
            Some(Arc::new(move |packet: &Packet| {
                let _ = tx.send(packet.payload().to_vec());
            })),
        )?;
        guard.installed = true;

        let mut words = Vec::with_capacity(size / 2);
        for offset in (0..size).step_by(MAX_TRANSFER_BYTES) {
            let transfer_addr = addr + offset as u64;
            let count = (size - offset).min(MAX_TRANSFER_BYTES) / 2;
            let header = header_payload(
                MemoryOp::ReadBulk {
                    words: count as u16,
                },
                transfer_addr,
                target.addr_width,
            )?;
            self.send(&Packet::event(target.addr.get(), HOST_BUS_ADDR, header))?;

            let expected = words.len() + count;
            while words.len() < expected {
                words.extend(wait(&rx, self.config.rpc_timeout, target.addr)?);
            }
            if words.len() > expected {
                log::warn!(
                    "Module {} sent {} surplus words",
                    target.addr,
                    words.len() - expected
                );
                words.truncate(expected);
            }
        }
        drop(guard);

        Ok(words_to_bytes(&words))
    }
}
