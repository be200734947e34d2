//! [`tokio_util::codec`] implementations for use with `Framed` streams.
use std::io::{self, Cursor};

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::words_to_le_bytes,
    error::ReadError,
    packet::{HEADER_WORDS, Packet},
    relay::RelayMessage,
};

/// Codec for raw packets on a byte stream.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    max_words: usize,
}

impl PacketCodec {
    pub fn new(max_words: usize) -> PacketCodec {
        PacketCodec { max_words }
    }
}

/// Number of bytes of the packet starting at `src[0]`, once its size word is available.
fn packet_frame_len(src: &[u8], max_words: usize) -> Result<Option<usize>, ReadError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let words = u16::from_le_bytes([src[0], src[1]]) as usize + 1;
    if words > max_words {
        return Err(ReadError::TooManyWords {
            max: max_words,
            got: words,
        });
    }
    if words < HEADER_WORDS {
        return Err(ReadError::InvalidFormat(format!(
            "Packet of {} words is smaller than the header",
            words
        )));
    }
    Ok(Some(words * 2))
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, io::Error> {
        let Some(len) = packet_frame_len(&src[..], self.max_words)? else {
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(len);
        Ok(Some(Packet::from_reader(
            &mut Cursor::new(&frame[..]),
            self.max_words,
        )?))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
        encode_packet(&item, dst)
    }
}

fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
    let words = packet
        .to_words()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    dst.put_slice(&words_to_le_bytes(&words));
    Ok(())
}

/// Codec for the messages exchanged with a relay daemon.
#[derive(Clone, Debug)]
pub struct RelayCodec {
    max_words: usize,
}

impl RelayCodec {
    pub fn new(max_words: usize) -> RelayCodec {
        RelayCodec { max_words }
    }

    fn frame_len(&self, src: &[u8]) -> Result<Option<usize>, ReadError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let (prefix_len, body) = match &src[..2] {
            b"pa" => (RelayMessage::CMD_NAME_PACKET.len() + 1, None),
            b"cl" => (RelayMessage::CMD_NAME_CLAIM.len() + 1, Some(2)),
            b"re" => (RelayMessage::CMD_NAME_RELEASE.len() + 1, Some(2)),
            prefix => {
                return Err(ReadError::InvalidCommandPrefix(
                    String::from_utf8_lossy(prefix).to_string(),
                ));
            }
        };
        match body {
            Some(len) => Ok(Some(prefix_len + len)),
            None if src.len() < prefix_len => Ok(None),
            None => Ok(packet_frame_len(&src[prefix_len..], self.max_words)?
                .map(|len| prefix_len + len)),
        }
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RelayMessage>, io::Error> {
        let Some(len) = self.frame_len(&src[..])? else {
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(len);
        Ok(Some(RelayMessage::from_reader(
            &mut Cursor::new(&frame[..]),
            self.max_words,
        )?))
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        let mut buf = Vec::new();
        item.write_to(&mut buf)?;
        dst.put_slice(&buf);
        Ok(())
    }
}
