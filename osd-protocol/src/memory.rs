//! Header layout of memory-access packets.
//!
//! A memory access starts with a header packet whose payload is
//! `[tag, addr_0, .., addr_n]`. The tag selects the operation, the address
//! follows in 16 bit chunks, low chunk first. Single (strobed) writes carry the
//! block data in the same packet, bulk writes follow up with plain data packets.
use crate::error::PacketError;

/// Largest number of bytes moved by a single bulk header.
pub const MAX_TRANSFER_BYTES: usize = 0x3f00;

const TAG_MASK: u16 = 0xc000;
const TAG_WRITE: u16 = 0x8000;
const TAG_WRITE_BULK: u16 = 0xc000;
const TAG_READ_BULK: u16 = 0x4000;
const ARG_MASK: u16 = 0x3fff;

/// The operation encoded in the first word of a memory-access header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryOp {
    /// Write one block, `strobe` has one bit per byte of the block (bit `i` enables byte `i`).
    Write { strobe: u16 },
    /// Write `words` data words, delivered in the following packets.
    WriteBulk { words: u16 },
    /// Read `words` data words, answered with event packets.
    ReadBulk { words: u16 },
}

impl MemoryOp {
    pub fn to_word(self) -> u16 {
        match self {
            MemoryOp::Write { strobe } => TAG_WRITE | (strobe & ARG_MASK),
            MemoryOp::WriteBulk { words } => TAG_WRITE_BULK | (words & ARG_MASK),
            MemoryOp::ReadBulk { words } => TAG_READ_BULK | (words & ARG_MASK),
        }
    }

    pub fn from_word(word: u16) -> Result<MemoryOp, PacketError> {
        let arg = word & ARG_MASK;
        match word & TAG_MASK {
            TAG_WRITE => Ok(MemoryOp::Write { strobe: arg }),
            TAG_WRITE_BULK => Ok(MemoryOp::WriteBulk { words: arg }),
            TAG_READ_BULK => Ok(MemoryOp::ReadBulk { words: arg }),
            _ => Err(PacketError::InvalidMemoryHeader(word)),
        }
    }
}

/// Number of 16 bit chunks an address of `addr_width` bits occupies.
pub fn address_chunks(addr_width: u16) -> Result<usize, PacketError> {
    if addr_width == 0 || addr_width > 64 {
        return Err(PacketError::InvalidAddressWidth(addr_width));
    }
    Ok(addr_width.div_ceil(16) as usize)
}

/// Splits `addr` into chunks, low chunk first.
pub fn encode_address(addr: u64, addr_width: u16) -> Result<Vec<u16>, PacketError> {
    let chunks = address_chunks(addr_width)?;
    Ok((0..chunks).map(|i| (addr >> (16 * i)) as u16).collect())
}

/// Reassembles an address from chunks, low chunk first.
pub fn decode_address(chunks: &[u16]) -> u64 {
    chunks
        .iter()
        .take(4)
        .enumerate()
        .fold(0, |addr, (i, chunk)| addr | (u64::from(*chunk) << (16 * i)))
}

/// Builds a header payload: the tag followed by the address chunks.
pub fn header_payload(op: MemoryOp, addr: u64, addr_width: u16) -> Result<Vec<u16>, PacketError> {
    let mut payload = Vec::with_capacity(5);
    payload.push(op.to_word());
    payload.extend(encode_address(addr, addr_width)?);
    Ok(payload)
}

/// Packs memory bytes into wire words. Each word holds the lower-addressed
/// byte in its high half. An odd trailing byte is zero padded.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Inverse of [`bytes_to_words`].
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}
