use std::fmt;
use std::io;

/// Errors raised by the session layer: message sizing and reassembly faults
/// that never cross into the transport itself.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SessionError {
    /// `send_message` was asked to send more than the maximum message size.
    TotalLengthOverflow { len: usize, max: usize },
    /// A TX or RX session exhausted its NACK-round budget.
    MaxNackRoundsExceeded,
    /// Reassembled slot lengths did not sum to the declared total length.
    ReassemblyInconsistent,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TotalLengthOverflow { len, max } => {
                write!(f, "message of {} bytes exceeds the {}-byte limit", len, max)
            }
            SessionError::MaxNackRoundsExceeded => write!(f, "exceeded maximum NACK rounds"),
            SessionError::ReassemblyInconsistent => {
                write!(f, "reassembled fragments do not sum to the declared length")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors raised by the serial transport.
#[derive(Debug)]
pub enum TransportError {
    /// The port was closed (or never opened) when a write was attempted.
    PortClosed,
    /// The underlying port returned an I/O error on write.
    WriteFailed(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::PortClosed => write!(f, "serial port is closed"),
            TransportError::WriteFailed(e) => write!(f, "serial write failed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::WriteFailed(e)
    }
}

/// The outcome of an application-initiated send, richer than the plain
/// boolean the facade surface exposes — useful for logging and tests.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SendOutcome {
    /// The receiver reassembled the message and acknowledged with DONE.
    Delivered,
    /// The session-timeout bound elapsed before DONE arrived.
    TimedOut,
    /// The caller's cancellation token fired before completion.
    Cancelled,
    /// A NACK round budget was exhausted, or the port failed outright.
    Failed,
}

impl SendOutcome {
    /// Collapses to the boolean the facade's `send_message` returns.
    #[inline]
    pub fn succeeded(self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}
