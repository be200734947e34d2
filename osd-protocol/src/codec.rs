/// Read and write implementations for packets and relay messages.
///
/// Words are transferred little-endian, the size word first.
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    packet::{HEADER_WORDS, Packet},
    relay::RelayMessage,
};

impl Packet {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let words = self
            .to_words()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        writer.write_all(&words_to_le_bytes(&words))
    }

    /// Reads one packet. Packets occupying more than `max_words` words on the wire are rejected.
    pub fn from_reader(reader: &mut impl Read, max_words: usize) -> Result<Packet, ReadError> {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        let size = u16::from_le_bytes(buf) as usize;
        if size + 1 > max_words {
            return Err(ReadError::TooManyWords {
                max: max_words,
                got: size + 1,
            });
        }
        if size + 1 < HEADER_WORDS {
            return Err(ReadError::InvalidFormat(format!(
                "Packet size {} is smaller than the header",
                size
            )));
        }
        let mut body = vec![0u8; size * 2];
        reader.read_exact(&mut body)?;

        let mut words = Vec::with_capacity(size + 1);
        words.push(size as u16);
        words.extend(le_bytes_to_words(&body));
        Ok(Packet::from_words(&words)?)
    }
}

pub(crate) fn words_to_le_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub(crate) fn le_bytes_to_words(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

impl RelayMessage {
    pub(crate) const CMD_NAME_PACKET: &[u8; 6] = b"packet";
    pub(crate) const CMD_NAME_CLAIM: &[u8; 5] = b"claim";
    pub(crate) const CMD_NAME_RELEASE: &[u8; 7] = b"release";
    pub(crate) const CMD_DELIMITER: u8 = b':';

    pub fn from_reader(reader: &mut impl Read, max_words: usize) -> Result<RelayMessage, ReadError> {
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf[..2])?;
        match &buf[..2] {
            b"pa" => {
                read_command(reader, &mut buf, Self::CMD_NAME_PACKET)?;
                Ok(RelayMessage::Packet(Packet::from_reader(reader, max_words)?))
            }
            b"cl" => {
                read_command(reader, &mut buf, Self::CMD_NAME_CLAIM)?;
                Ok(RelayMessage::Claim(read_u16(reader)?))
            }
            b"re" => {
                read_command(reader, &mut buf, Self::CMD_NAME_RELEASE)?;
                Ok(RelayMessage::Release(read_u16(reader)?))
            }
            _ => Err(ReadError::InvalidCommandPrefix(
                String::from_utf8_lossy(&buf[..2]).to_string(),
            )),
        }
    }

    /// Writes `packet` as a relayed packet without taking ownership of it.
    pub fn write_packet(packet: &Packet, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(Self::CMD_NAME_PACKET)?;
        writer.write_all(&[Self::CMD_DELIMITER])?;
        packet.write_to(writer)
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        match self {
            RelayMessage::Packet(packet) => Self::write_packet(packet, writer),
            RelayMessage::Claim(addr) => {
                writer.write_all(Self::CMD_NAME_CLAIM)?;
                writer.write_all(&[Self::CMD_DELIMITER])?;
                writer.write_all(&addr.to_le_bytes())
            }
            RelayMessage::Release(addr) => {
                writer.write_all(Self::CMD_NAME_RELEASE)?;
                writer.write_all(&[Self::CMD_DELIMITER])?;
                writer.write_all(&addr.to_le_bytes())
            }
        }
    }
}

/// Reads the remainder of a command name (the first two bytes are already in `buf`)
/// and its delimiter.
fn read_command(reader: &mut impl Read, buf: &mut [u8; 16], name: &[u8]) -> Result<(), ReadError> {
    reader.read_exact(&mut buf[2..name.len() + 1])?;
    if &buf[..name.len()] != name || buf[name.len()] != RelayMessage::CMD_DELIMITER {
        return Err(ReadError::InvalidCommand(
            String::from_utf8_lossy(&buf[..name.len() + 1]).to_string(),
        ));
    }
    Ok(())
}

fn read_u16(reader: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
