//! The fragment protocol: DATA/NACK/DONE messages carried inside one-hop RF
//! payloads. Every function here is pure — no I/O, no allocation beyond what
//! the caller's buffer already holds.

use crate::crc16;
use crate::error::FragmentParseError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Fixed protocol version understood by this crate.
pub const VERSION: u8 = 0x01;

pub const TYPE_DATA: u8 = 0x01;
pub const TYPE_NACK: u8 = 0x02;
pub const TYPE_DONE: u8 = 0x03;

/// Size of a DATA header in bytes, before payload and CRC.
pub const HEADER_SIZE: usize = 13;
/// Size of the trailing CRC-16 on every fragment-protocol message.
pub const CRC_SIZE: usize = 2;
/// Total size of a DONE message.
pub const DONE_SIZE: usize = 1 + 1 + 2 + CRC_SIZE;

/// The 13-byte DATA header, decoded into its fields.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct DataHeader {
    pub version: u8,
    pub msg_id: u16,
    pub total_len: u32,
    pub frag_idx: u16,
    pub frag_cnt: u16,
    pub payload_len: u8,
}

impl DataHeader {
    /// Encodes the header into `buf[..HEADER_SIZE]`. Panics if `buf` is too
    /// small, same as the rest of this crate's fixed-size writers.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) {
        let mut cursor = Cursor::new(&mut buf[..HEADER_SIZE]);
        cursor.write_u8(self.version).unwrap();
        cursor.write_u8(TYPE_DATA).unwrap();
        cursor.write_u16::<BigEndian>(self.msg_id).unwrap();
        cursor.write_u32::<BigEndian>(self.total_len).unwrap();
        cursor.write_u16::<BigEndian>(self.frag_idx).unwrap();
        cursor.write_u16::<BigEndian>(self.frag_cnt).unwrap();
        cursor.write_u8(self.payload_len).unwrap();
    }

    /// Decodes a header from the front of `buf`. `buf` must be at least
    /// [`HEADER_SIZE`] bytes; the type tag is checked by the caller via
    /// [`peek_type`], not here.
    #[inline]
    pub fn decode(buf: &[u8]) -> Option<DataHeader> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u8().ok()?;
        let _type_tag = cursor.read_u8().ok()?;
        let msg_id = cursor.read_u16::<BigEndian>().ok()?;
        let total_len = cursor.read_u32::<BigEndian>().ok()?;
        let frag_idx = cursor.read_u16::<BigEndian>().ok()?;
        let frag_cnt = cursor.read_u16::<BigEndian>().ok()?;
        let payload_len = cursor.read_u8().ok()?;

        Some(DataHeader {
            version,
            msg_id,
            total_len,
            frag_idx,
            frag_cnt,
            payload_len,
        })
    }
}

/// Reads the second byte of a fragment-protocol message without otherwise
/// validating it, so the receiver can dispatch before doing any real parse
/// work.
#[inline]
pub fn peek_type(buf: &[u8]) -> Option<u8> {
    buf.get(1).copied()
}

/// Builds a complete DATA fragment (`header || payload || crc`) into a
/// freshly allocated buffer.
pub fn build_data(header: &DataHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.payload_len as usize, payload.len());
    let mut buf = vec![0u8; HEADER_SIZE + payload.len() + CRC_SIZE];
    header.encode(&mut buf);
    buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    crc16::append(&mut buf, HEADER_SIZE + payload.len());
    buf
}

/// Validates and decodes a DATA fragment, returning the header and a slice
/// of `buf` holding just the payload. Fails closed: CRC mismatch, an
/// under-length buffer, or an unrecognized version are all rejected without
/// side effects.
pub fn parse_data<'a>(buf: &'a [u8]) -> Result<(DataHeader, &'a [u8]), FragmentParseError> {
    if buf.len() < HEADER_SIZE + CRC_SIZE {
        return Err(FragmentParseError::Underrun);
    }
    if !crc16::verify(buf) {
        return Err(FragmentParseError::BadCrc);
    }
    let header = DataHeader::decode(buf).ok_or(FragmentParseError::Underrun)?;
    if header.version != VERSION {
        return Err(FragmentParseError::UnknownVersion(header.version));
    }
    let payload_end = HEADER_SIZE + header.payload_len as usize;
    if buf.len() < payload_end + CRC_SIZE {
        return Err(FragmentParseError::Underrun);
    }
    Ok((header, &buf[HEADER_SIZE..payload_end]))
}

/// Builds a NACK message listing `missing_indices` for `msg_id`.
pub fn build_nack(msg_id: u16, missing_indices: &[u16]) -> Vec<u8> {
    let count = missing_indices.len();
    let body_len = 1 + 1 + 2 + 1 + count * 2;
    let mut buf = vec![0u8; body_len + CRC_SIZE];
    {
        let mut cursor = Cursor::new(&mut buf[..body_len]);
        cursor.write_u8(VERSION).unwrap();
        cursor.write_u8(TYPE_NACK).unwrap();
        cursor.write_u16::<BigEndian>(msg_id).unwrap();
        cursor.write_u8(count as u8).unwrap();
        for &idx in missing_indices {
            cursor.write_u16::<BigEndian>(idx).unwrap();
        }
    }
    crc16::append(&mut buf, body_len);
    buf
}

/// A parsed NACK: the message id and the fragment indices the peer is
/// still missing.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Nack {
    pub msg_id: u16,
    pub missing_indices: Vec<u16>,
}

/// Parses a NACK message, fail-closed on CRC or version mismatch.
pub fn parse_nack(buf: &[u8]) -> Result<Nack, FragmentParseError> {
    if buf.len() < 1 + 1 + 2 + 1 + CRC_SIZE {
        return Err(FragmentParseError::Underrun);
    }
    if !crc16::verify(buf) {
        return Err(FragmentParseError::BadCrc);
    }
    let mut cursor = Cursor::new(buf);
    let version = cursor.read_u8().map_err(|_| FragmentParseError::Underrun)?;
    if version != VERSION {
        return Err(FragmentParseError::UnknownVersion(version));
    }
    let type_tag = cursor.read_u8().map_err(|_| FragmentParseError::Underrun)?;
    if type_tag != TYPE_NACK {
        return Err(FragmentParseError::UnknownType(type_tag));
    }
    let msg_id = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| FragmentParseError::Underrun)?;
    let count = cursor.read_u8().map_err(|_| FragmentParseError::Underrun)? as usize;

    let expected_len = 1 + 1 + 2 + 1 + count * 2 + CRC_SIZE;
    if buf.len() < expected_len {
        return Err(FragmentParseError::Underrun);
    }

    let mut missing_indices = Vec::with_capacity(count);
    for _ in 0..count {
        missing_indices.push(
            cursor
                .read_u16::<BigEndian>()
                .map_err(|_| FragmentParseError::Underrun)?,
        );
    }

    Ok(Nack { msg_id, missing_indices })
}

/// Builds a DONE message for `msg_id`.
pub fn build_done(msg_id: u16) -> [u8; DONE_SIZE] {
    let mut buf = [0u8; DONE_SIZE];
    {
        let mut cursor = Cursor::new(&mut buf[..DONE_SIZE - CRC_SIZE]);
        cursor.write_u8(VERSION).unwrap();
        cursor.write_u8(TYPE_DONE).unwrap();
        cursor.write_u16::<BigEndian>(msg_id).unwrap();
    }
    crc16::append(&mut buf, DONE_SIZE - CRC_SIZE);
    buf
}

/// Parses a DONE message, returning the message id it acknowledges.
pub fn parse_done(buf: &[u8]) -> Result<u16, FragmentParseError> {
    if buf.len() < DONE_SIZE {
        return Err(FragmentParseError::Underrun);
    }
    if !crc16::verify(&buf[..DONE_SIZE]) {
        return Err(FragmentParseError::BadCrc);
    }
    let mut cursor = Cursor::new(buf);
    let version = cursor.read_u8().map_err(|_| FragmentParseError::Underrun)?;
    if version != VERSION {
        return Err(FragmentParseError::UnknownVersion(version));
    }
    let type_tag = cursor.read_u8().map_err(|_| FragmentParseError::Underrun)?;
    if type_tag != TYPE_DONE {
        return Err(FragmentParseError::UnknownType(type_tag));
    }
    cursor
        .read_u16::<BigEndian>()
        .map_err(|_| FragmentParseError::Underrun)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(msg_id: u16, total_len: u32, frag_idx: u16, frag_cnt: u16, payload_len: u8) -> DataHeader {
        DataHeader {
            version: VERSION,
            msg_id,
            total_len,
            frag_idx,
            frag_cnt,
            payload_len,
        }
    }

    #[test]
    fn data_header_round_trips() {
        let h = header(42, 95, 1, 4, 30);
        let mut buf = [0u8; HEADER_SIZE];
        h.encode(&mut buf);
        assert_eq!(DataHeader::decode(&buf), Some(h));
    }

    #[test]
    fn data_fragment_round_trips() {
        let h = header(7, 5, 0, 1, 5);
        let payload = b"hello";
        let framed = build_data(&h, payload);
        let (decoded, slice) = parse_data(&framed).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(slice, payload);
    }

    #[test]
    fn data_fragment_rejects_corrupt_payload() {
        let h = header(7, 5, 0, 1, 5);
        let mut framed = build_data(&h, b"hello");
        framed[HEADER_SIZE] ^= 0xFF;
        assert_eq!(parse_data(&framed), Err(FragmentParseError::BadCrc));
    }

    #[test]
    fn data_fragment_rejects_unknown_version() {
        let mut h = header(7, 5, 0, 1, 5);
        h.version = 0x02;
        let framed = build_data(&h, b"hello");
        assert_eq!(
            parse_data(&framed),
            Err(FragmentParseError::UnknownVersion(0x02))
        );
    }

    #[test]
    fn nack_round_trips() {
        let encoded = build_nack(99, &[1, 2, 5]);
        let decoded = parse_nack(&encoded).unwrap();
        assert_eq!(decoded.msg_id, 99);
        assert_eq!(decoded.missing_indices, vec![1, 2, 5]);
    }

    #[test]
    fn nack_with_no_missing_indices() {
        let encoded = build_nack(1, &[]);
        let decoded = parse_nack(&encoded).unwrap();
        assert!(decoded.missing_indices.is_empty());
    }

    #[test]
    fn done_round_trips() {
        let encoded = build_done(1234);
        assert_eq!(encoded.len(), DONE_SIZE);
        assert_eq!(parse_done(&encoded), Ok(1234));
    }

    #[test]
    fn done_rejects_bad_crc() {
        let mut encoded = build_done(1234);
        encoded[0] ^= 0x01;
        assert_eq!(parse_done(&encoded), Err(FragmentParseError::BadCrc));
    }

    #[test]
    fn peek_type_reads_second_byte() {
        let encoded = build_done(1);
        assert_eq!(peek_type(&encoded), Some(TYPE_DONE));
    }

    #[test]
    fn random_payloads_round_trip() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len: u8 = rng.gen_range(0..=64);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let h = header(rng.gen(), len as u32, 0, 1, len);
            let framed = build_data(&h, &payload);
            let (decoded, slice) = parse_data(&framed).unwrap();
            assert_eq!(decoded, h);
            assert_eq!(slice, payload.as_slice());
        }
    }
}
