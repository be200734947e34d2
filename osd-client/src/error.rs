use std::{io, time::Duration};

use osd_protocol::error::PacketError;
use thiserror::Error;

use crate::directory::{BusAddr, ModuleIndex};

/// Errors reported by the debug system client.
#[derive(Debug, Error)]
pub enum Error {
    /// Sending, receiving or connecting failed.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    /// The system control module could not be identified or described.
    #[error("cannot enumerate debug system: {0}")]
    CannotEnumerate(String),
    /// No response arrived within the configured RPC timeout.
    #[error("no response from module {bus} within {timeout:?}")]
    Timeout { bus: BusAddr, timeout: Duration },
    /// The transport stopped delivering packets while a request was outstanding.
    #[error("connection to the debug system was closed")]
    Disconnected,
    /// The operation needs the module directory, but the system was not enumerated.
    #[error("debug system has not been enumerated")]
    NotEnumerated,
    #[error("no module with index {0}")]
    UnknownModule(ModuleIndex),
    #[error("module {0} is not a memory module")]
    NotMemoryModule(ModuleIndex),
    /// A response did not have the expected shape.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid packet: {0}")]
    Packet(#[from] PacketError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The coarse result domain exposed to callers that need numeric status codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    GenericError = 1,
    CannotEnumerate = 2,
}

impl Error {
    pub fn code(&self) -> ResultCode {
        match self {
            Error::CannotEnumerate(_) => ResultCode::CannotEnumerate,
            _ => ResultCode::GenericError,
        }
    }
}

impl<T> From<&Result<T>> for ResultCode {
    fn from(value: &Result<T>) -> Self {
        match value {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

#[test]
fn result_codes() {
    let ok: Result<()> = Ok(());
    assert_eq!(ResultCode::from(&ok), ResultCode::Success);
    assert_eq!(
        Error::CannotEnumerate("bad type".into()).code() as u8,
        2
    );
    assert_eq!(Error::Disconnected.code(), ResultCode::GenericError);
}
