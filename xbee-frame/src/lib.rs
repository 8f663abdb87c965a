//! Pure wire codecs for talking to an XBee radio in API Mode 2 (escaped):
//! the outer frame encoding/parsing and the fragment protocol carried
//! inside its RF payloads. Nothing in this crate touches a socket, a
//! serial port, or a clock — see the `meshlink` crate for the stateful
//! engine built on top.

pub mod apiframe;
pub mod crc16;
pub mod error;
pub mod fragment;

pub use apiframe::{ApiFrame, FrameBuilder, FrameIdAllocator, FrameParser};
pub use error::{FragmentParseError, FramingError};
