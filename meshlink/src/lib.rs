//! The stateful engine built on top of `xbee-frame`: serial port
//! ownership, the XBee device, session management, fragment
//! reassembly/retransmission, and the application-facing facade.

pub mod broadcast;
pub mod config;
pub mod counters;
pub mod device;
pub mod error;
pub mod facade;
pub mod oneshot;
pub mod receiver;
pub mod serial;
pub mod session;
pub mod transmitter;

pub use config::Config;
pub use counters::CounterSnapshot;
pub use error::{SendOutcome, SessionError, TransportError};
pub use facade::MeshLink;
pub use oneshot::CancelToken;
