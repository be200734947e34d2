use std::{
    error::Error,
    fmt::Display,
    io::{self},
};

/// Violations of the packet framing rules.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketError {
    /// Fewer words than the fixed header requires.
    Truncated { expected: usize, got: usize },
    /// The size word disagrees with the number of words present.
    SizeMismatch { declared: usize, actual: usize },
    /// The packet does not fit into the size word or a negotiated limit.
    TooLarge { max: usize, got: usize },
    /// A memory-access header word could not be decoded.
    InvalidMemoryHeader(u16),
    /// An address width outside of 1 to 64 bits.
    InvalidAddressWidth(u16),
}

impl Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::Truncated { expected, got } => {
                write!(f, "Packet truncated: expected {} words, got {}", expected, got)
            }
            PacketError::SizeMismatch { declared, actual } => write!(
                f,
                "Packet declares {} trailing words but carries {}",
                declared, actual
            ),
            PacketError::TooLarge { max, got } => {
                write!(f, "Packet too large! Maximum is {} words, but got {}", max, got)
            }
            PacketError::InvalidMemoryHeader(word) => {
                write!(f, "Invalid memory access header {:#06x}", word)
            }
            PacketError::InvalidAddressWidth(width) => {
                write!(f, "Invalid address width of {} bits", width)
            }
        }
    }
}

impl Error for PacketError {}

/// Errors that may occur when reading a packet or relay message from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    InvalidCommand(String),
    InvalidCommandPrefix(String),
    InvalidFormat(String),
    TooManyWords { max: usize, got: usize },
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl From<PacketError> for ReadError {
    fn from(value: PacketError) -> Self {
        ReadError::InvalidFormat(value.to_string())
    }
}

impl From<ReadError> for io::Error {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::IoError(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::InvalidCommand(cmd) => write!(f, "Received invalid command {}", cmd),
            ReadError::InvalidFormat(format) => write!(f, "{}", format),
            ReadError::InvalidCommandPrefix(prefix) => {
                write!(f, "Received invalid command with prefix {}", prefix)
            }
            ReadError::TooManyWords { max, got } => {
                write!(f, "Packet too large! Maximum is {} words, but got {}", max, got)
            }
        }
    }
}

impl Error for ReadError {}
