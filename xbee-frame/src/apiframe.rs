//! XBee API Mode 2 (escaped) framing: `0x7E || len_hi || len_lo || body ||
//! checksum`, with `{0x7E, 0x7D, 0x11, 0x13}` escaped as `0x7D, byte ^ 0x20`
//! everywhere except the leading start delimiter.

use crate::error::FramingError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const START_DELIMITER: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

const FRAME_TX_REQUEST: u8 = 0x10;
const FRAME_RX_PACKET: u8 = 0x90;
const FRAME_EXPLICIT_RX: u8 = 0x91;
const FRAME_TX_STATUS: u8 = 0x8B;
const FRAME_AT_COMMAND: u8 = 0x08;
const FRAME_AT_RESPONSE: u8 = 0x88;

const MAX_FRAME_LEN: u16 = 256;

pub const UNKNOWN_16BIT_ADDR: u16 = 0xFFFE;
pub const BROADCAST_64BIT_ADDR: u64 = 0x0000_0000_0000_FFFF;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0x7E | 0x7D | 0x11 | 0x13)
}

/// Assigns frame ids in `1..=255`, wrapping and skipping 0 — a frame id of 0
/// means "no response expected" and must never be handed out.
#[derive(Debug, Default)]
pub struct FrameIdAllocator {
    next: u8,
}

impl FrameIdAllocator {
    pub fn new() -> FrameIdAllocator {
        FrameIdAllocator { next: 1 }
    }

    /// Returns the next frame id and advances the counter.
    pub fn next_id(&mut self) -> u8 {
        let id = if self.next == 0 { 1 } else { self.next };
        self.next = if id == 255 { 1 } else { id + 1 };
        id
    }
}

/// Builds outgoing API frames, escaping them for the wire.
pub struct FrameBuilder;

impl FrameBuilder {
    /// Builds a 0x10 Transmit Request frame addressed to `dest64` carrying
    /// `rf_data`, tagged with `frame_id` verbatim (0 means "no TX-status
    /// wanted", per callers in `device.rs`). Returns `frame_id` alongside
    /// the escaped wire bytes for the caller's convenience.
    pub fn tx_request(dest64: u64, rf_data: &[u8], frame_id: u8) -> (u8, Vec<u8>) {
        let mut body = Vec::with_capacity(12 + rf_data.len());
        body.write_u8(FRAME_TX_REQUEST).unwrap();
        body.write_u8(frame_id).unwrap();
        body.write_u64::<BigEndian>(dest64).unwrap();
        body.write_u16::<BigEndian>(UNKNOWN_16BIT_ADDR).unwrap();
        body.write_u8(0).unwrap(); // broadcast radius: 0 = max hops
        body.write_u8(0).unwrap(); // options: none
        body.extend_from_slice(rf_data);

        (frame_id, Self::frame(&body))
    }

    /// Builds a 0x08 AT Command frame. `at_code` is the two-character ASCII
    /// command (e.g. `*b"SH"`); `params` is the optional parameter value.
    pub fn at_command(ids: &mut FrameIdAllocator, at_code: [u8; 2], params: Option<&[u8]>) -> (u8, Vec<u8>) {
        let frame_id = ids.next_id();
        let mut body = Vec::with_capacity(4 + params.map_or(0, |p| p.len()));
        body.write_u8(FRAME_AT_COMMAND).unwrap();
        body.write_u8(frame_id).unwrap();
        body.extend_from_slice(&at_code);
        if let Some(params) = params {
            body.extend_from_slice(params);
        }

        (frame_id, Self::frame(&body))
    }

    /// Frames `body`: prepends the length, appends the checksum, then
    /// escapes everything after the leading start delimiter.
    fn frame(body: &[u8]) -> Vec<u8> {
        let len = body.len() as u16;
        let checksum = 0xFFu8.wrapping_sub(body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)));

        let mut raw = Vec::with_capacity(1 + 2 + body.len() + 1);
        raw.push(START_DELIMITER);
        raw.write_u16::<BigEndian>(len).unwrap();
        raw.extend_from_slice(body);
        raw.push(checksum);

        escape(&raw)
    }
}

/// Escapes every reserved byte after the leading start delimiter.
fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 4);
    out.push(raw[0]);
    for &byte in &raw[1..] {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// A fully parsed, typed API frame.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ApiFrame {
    /// A Receive Packet (0x90), or an Explicit Rx (0x91) promoted to this
    /// shape for uniform downstream handling.
    RxPacket {
        src64: u64,
        src16: u16,
        options: u8,
        rf_data: Vec<u8>,
    },
    TxStatus {
        frame_id: u8,
        dst16: u16,
        retries: u8,
        delivery_status: u8,
        discovery_status: u8,
    },
    AtResponse {
        frame_id: u8,
        at_code: [u8; 2],
        status: u8,
        data: Vec<u8>,
    },
}

fn parse_body(body: &[u8]) -> Result<ApiFrame, FramingError> {
    let frame_type = body[0];
    let rest = &body[1..];

    match frame_type {
        FRAME_RX_PACKET => {
            if rest.len() < 11 {
                return Err(FramingError::Underrun {
                    frame_type,
                    len: body.len(),
                });
            }
            let mut cursor = Cursor::new(rest);
            let src64 = cursor.read_u64::<BigEndian>().unwrap();
            let src16 = cursor.read_u16::<BigEndian>().unwrap();
            let options = cursor.read_u8().unwrap();
            let rf_data = rest[11..].to_vec();
            Ok(ApiFrame::RxPacket {
                src64,
                src16,
                options,
                rf_data,
            })
        }
        FRAME_EXPLICIT_RX => {
            if rest.len() < 17 {
                return Err(FramingError::Underrun {
                    frame_type,
                    len: body.len(),
                });
            }
            let mut cursor = Cursor::new(rest);
            let src64 = cursor.read_u64::<BigEndian>().unwrap();
            let src16 = cursor.read_u16::<BigEndian>().unwrap();
            let _src_ep = cursor.read_u8().unwrap();
            let _dst_ep = cursor.read_u8().unwrap();
            let _cluster = cursor.read_u16::<BigEndian>().unwrap();
            let _profile = cursor.read_u16::<BigEndian>().unwrap();
            let options = cursor.read_u8().unwrap();
            let rf_data = rest[17..].to_vec();
            // Promoted to a virtual RxPacket: downstream code only ever sees 0x90 shapes.
            Ok(ApiFrame::RxPacket {
                src64,
                src16,
                options,
                rf_data,
            })
        }
        FRAME_TX_STATUS => {
            if rest.len() < 6 {
                return Err(FramingError::Underrun {
                    frame_type,
                    len: body.len(),
                });
            }
            let mut cursor = Cursor::new(rest);
            let frame_id = cursor.read_u8().unwrap();
            let dst16 = cursor.read_u16::<BigEndian>().unwrap();
            let retries = cursor.read_u8().unwrap();
            let delivery_status = cursor.read_u8().unwrap();
            let discovery_status = cursor.read_u8().unwrap();
            Ok(ApiFrame::TxStatus {
                frame_id,
                dst16,
                retries,
                delivery_status,
                discovery_status,
            })
        }
        FRAME_AT_RESPONSE => {
            if rest.len() < 4 {
                return Err(FramingError::Underrun {
                    frame_type,
                    len: body.len(),
                });
            }
            let frame_id = rest[0];
            let at_code = [rest[1], rest[2]];
            let status = rest[3];
            let data = rest[4..].to_vec();
            Ok(ApiFrame::AtResponse {
                frame_id,
                at_code,
                status,
                data,
            })
        }
        other => Err(FramingError::UnsupportedType(other)),
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    WaitingForStart,
    LengthMsb,
    LengthLsb,
    FrameData,
    Checksum,
}

/// Byte-fed stream parser for API Mode 2 framing. Feed it bytes one at a
/// time (or in batches via [`FrameParser::feed_bytes`]); it emits a
/// `Result` each time a frame boundary completes, and resets cleanly after
/// any error so the next `0x7E` resynchronizes the stream.
pub struct FrameParser {
    state: State,
    escape_latch: bool,
    length_hi: u8,
    length: u16,
    checksum_acc: u8,
    buf: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            state: State::WaitingForStart,
            escape_latch: false,
            length_hi: 0,
            length: 0,
            checksum_acc: 0,
            buf: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.state = State::WaitingForStart;
        self.escape_latch = false;
        self.length = 0;
        self.checksum_acc = 0;
        self.buf.clear();
    }

    /// Feeds a whole batch of bytes, returning every frame (or framing
    /// error) that completed along the way, in order.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<Result<ApiFrame, FramingError>> {
        let mut out = Vec::new();
        for &byte in bytes {
            if let Some(result) = self.feed(byte) {
                out.push(result);
            }
        }
        out
    }

    /// Feeds a single byte. Returns `Some` when a frame boundary completed
    /// (successfully or not).
    pub fn feed(&mut self, byte: u8) -> Option<Result<ApiFrame, FramingError>> {
        if self.escape_latch {
            self.escape_latch = false;
            return self.advance(byte ^ ESCAPE_XOR);
        }

        if byte == START_DELIMITER {
            self.state = State::LengthMsb;
            self.checksum_acc = 0;
            self.buf.clear();
            return None;
        }

        if byte == ESCAPE {
            if self.state != State::WaitingForStart {
                self.escape_latch = true;
            }
            return None;
        }

        self.advance(byte)
    }

    fn advance(&mut self, byte: u8) -> Option<Result<ApiFrame, FramingError>> {
        match self.state {
            State::WaitingForStart => None,
            State::LengthMsb => {
                self.length_hi = byte;
                self.state = State::LengthLsb;
                None
            }
            State::LengthLsb => {
                let length = u16::from_be_bytes([self.length_hi, byte]);
                if length == 0 || length > MAX_FRAME_LEN {
                    self.reset();
                    return Some(Err(FramingError::BadLength(length)));
                }
                self.length = length;
                self.buf.reserve(length as usize);
                self.state = State::FrameData;
                None
            }
            State::FrameData => {
                self.buf.push(byte);
                self.checksum_acc = self.checksum_acc.wrapping_add(byte);
                if self.buf.len() == self.length as usize {
                    self.state = State::Checksum;
                }
                None
            }
            State::Checksum => {
                let total = self.checksum_acc.wrapping_add(byte);
                let result = if total == 0xFF {
                    parse_body(&self.buf)
                } else {
                    Err(FramingError::ChecksumMismatch)
                };
                self.reset();
                Some(result)
            }
        }
    }
}
