use std::fmt;

/// Errors raised while framing or parsing bytes at the API Mode 2 level.
///
/// These are always local to the parser/encoder that produced them: nothing
/// in this crate ever retries or propagates them further than the caller.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum FramingError {
    /// Declared frame length was zero or exceeded the 256-byte cap.
    BadLength(u16),
    /// The trailing checksum byte did not match the accumulated body sum.
    ChecksumMismatch,
    /// A frame body was too short to contain the fields its type requires.
    Underrun { frame_type: u8, len: usize },
    /// Frame type byte did not match any of the dispatched API frame kinds.
    UnsupportedType(u8),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::BadLength(len) => write!(f, "invalid frame length {}", len),
            FramingError::ChecksumMismatch => write!(f, "frame checksum mismatch"),
            FramingError::Underrun { frame_type, len } => {
                write!(f, "frame type 0x{:02x} underrun at {} bytes", frame_type, len)
            }
            FramingError::UnsupportedType(t) => write!(f, "unsupported api frame type 0x{:02x}", t),
        }
    }
}

impl std::error::Error for FramingError {}

/// Errors raised while parsing a fragment-protocol message (DATA/NACK/DONE).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum FragmentParseError {
    /// Buffer too short to hold the declared message.
    Underrun,
    /// CRC-16 trailer did not match.
    BadCrc,
    /// Protocol version byte was not the one this crate understands.
    UnknownVersion(u8),
    /// Type tag byte did not match DATA/NACK/DONE.
    UnknownType(u8),
}

impl fmt::Display for FragmentParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentParseError::Underrun => write!(f, "message shorter than its declared fields"),
            FragmentParseError::BadCrc => write!(f, "message failed CRC validation"),
            FragmentParseError::UnknownVersion(v) => write!(f, "unknown protocol version {}", v),
            FragmentParseError::UnknownType(t) => write!(f, "unknown message type 0x{:02x}", t),
        }
    }
}

impl std::error::Error for FragmentParseError {}
