//! Packet framing: the 24-byte ADB header plus payload, and the checksum/
//! magic rules that make a decoded packet well-formed.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read, Write};

use crate::error::AdbError;

const HEADER_LEN: usize = 24;

const fn tag(b: [u8; 4]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16) | ((b[3] as u32) << 24)
}

pub const A_SYNC: u32 = tag(*b"SYNC");
pub const A_CNXN: u32 = tag(*b"CNXN");
pub const A_AUTH: u32 = tag(*b"AUTH");
pub const A_OPEN: u32 = tag(*b"OPEN");
pub const A_OKAY: u32 = tag(*b"OKAY");
pub const A_CLSE: u32 = tag(*b"CLSE");
pub const A_WRTE: u32 = tag(*b"WRTE");
pub const A_STLS: u32 = tag(*b"STLS");

/// `arg0` of the initial CNXN: protocol version 1.0.
pub const CNXN_VERSION: u32 = 0x0100_0000;
/// `arg1` of the initial CNXN: max payload this side accepts, 256 KiB.
pub const CNXN_MAX_PAYLOAD: u32 = 256 * 1024;

pub const AUTH_TYPE_TOKEN: u32 = 1;
pub const AUTH_TYPE_SIGNATURE: u32 = 2;
pub const AUTH_TYPE_RSA_PUBLIC_KEY: u32 = 3;

/// The protocol's atomic unit: a command, two command-specific args, and a
/// payload whose length and checksum are carried in the header.
///
/// `data_length`, `data_checksum` and `magic` are the header fields as they
/// appeared on the wire (or as freshly computed, for a locally-built
/// packet). They are kept alongside `payload` so [`Packet::is_valid`] can
/// compare declared against actual without re-decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
    data_length: u32,
    data_checksum: u32,
    magic: u32,
}

impl Packet {
    pub fn new(command: u32, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        let data_length = payload.len() as u32;
        let data_checksum = Self::checksum(&payload);
        let magic = Self::magic_of(command);
        Self { command, arg0, arg1, payload, data_length, data_checksum, magic }
    }

    fn checksum(payload: &[u8]) -> u32 {
        payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
    }

    fn magic_of(command: u32) -> u32 {
        command ^ 0xFFFF_FFFF
    }

    /// Whether the header fields declared on the wire are consistent with
    /// the payload actually read. Decode never calls this itself; callers
    /// apply it where strictness matters (the handshake does not, to
    /// tolerate peers with stale checksum fields on OKAY).
    pub fn is_valid(&self) -> bool {
        self.magic == Self::magic_of(self.command)
            && self.data_length as usize == self.payload.len()
            && self.data_checksum == Self::checksum(&self.payload)
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), AdbError> {
        let mut header = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], self.command);
        LittleEndian::write_u32(&mut header[4..8], self.arg0);
        LittleEndian::write_u32(&mut header[8..12], self.arg1);
        LittleEndian::write_u32(&mut header[12..16], self.payload.len() as u32);
        LittleEndian::write_u32(&mut header[16..20], Self::checksum(&self.payload));
        LittleEndian::write_u32(&mut header[20..24], Self::magic_of(self.command));
        w.write_all(&header).map_err(AdbError::TransportError)?;
        if !self.payload.is_empty() {
            w.write_all(&self.payload).map_err(AdbError::TransportError)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, AdbError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_truncated(r, &mut header)?;
        let command = LittleEndian::read_u32(&header[0..4]);
        let arg0 = LittleEndian::read_u32(&header[4..8]);
        let arg1 = LittleEndian::read_u32(&header[8..12]);
        let data_length = LittleEndian::read_u32(&header[12..16]);
        let data_checksum = LittleEndian::read_u32(&header[16..20]);
        let magic = LittleEndian::read_u32(&header[20..24]);

        let mut payload = vec![0u8; data_length as usize];
        if data_length > 0 {
            read_exact_truncated(r, &mut payload)?;
        }
        Ok(Packet { command, arg0, arg1, payload, data_length, data_checksum, magic })
    }
}

/// Like `Read::read_exact`, but a zero-byte or short read before the
/// buffer fills is reported as `Truncated` rather than the generic
/// `UnexpectedEof` io error, matching the decode contract in §4.1.
fn read_exact_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), AdbError> {
    let mut read = 0;
    while read < buf.len() {
        let n = r.read(&mut buf[read..]).map_err(AdbError::TransportError)?;
        if n == 0 {
            return Err(AdbError::Truncated);
        }
        read += n;
    }
    Ok(())
}

/// Human-readable command name for logging; unknown commands print as hex.
pub fn command_name(command: u32) -> String {
    match command {
        A_SYNC => "SYNC".into(),
        A_CNXN => "CNXN".into(),
        A_AUTH => "AUTH".into(),
        A_OPEN => "OPEN".into(),
        A_OKAY => "OKAY".into(),
        A_CLSE => "CLSE".into(),
        A_WRTE => "WRTE".into(),
        A_STLS => "STLS".into(),
        other => format!("{:#010x}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_known_bytes_is_6() {
        assert_eq!(Packet::checksum(&[0x01, 0x02, 0x03]), 6);
    }

    #[test]
    fn checksum_of_empty_payload_is_0() {
        assert_eq!(Packet::checksum(&[]), 0);
    }

    #[test]
    fn magic_is_command_xor_all_ones() {
        for cmd in [A_SYNC, A_CNXN, A_AUTH, A_OPEN, A_OKAY, A_CLSE, A_WRTE, A_STLS] {
            assert_eq!(Packet::magic_of(cmd) ^ cmd, 0xFFFF_FFFF);
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        for (cmd, arg0, arg1, payload) in [
            (A_CNXN, 0x0100_0000u32, 256 * 1024u32, b"host::\x00".to_vec()),
            (A_OPEN, 1, 0, b"shell:ls\x00".to_vec()),
            (A_WRTE, 1, 42, b"hello".to_vec()),
            (A_CLSE, 1, 42, Vec::new()),
        ] {
            let pkt = Packet::new(cmd, arg0, arg1, payload);
            let mut buf = Vec::new();
            pkt.encode(&mut buf).unwrap();
            let mut cursor = io::Cursor::new(buf);
            let decoded = Packet::decode(&mut cursor).unwrap();
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn decode_header_short_read_is_truncated() {
        let mut cursor = io::Cursor::new(vec![0u8; 10]);
        let err = Packet::decode(&mut cursor).unwrap_err();
        assert!(matches!(err, AdbError::Truncated));
    }

    #[test]
    fn decode_payload_short_read_is_truncated() {
        let pkt = Packet::new(A_WRTE, 1, 2, b"hello world".to_vec());
        let mut buf = Vec::new();
        pkt.encode(&mut buf).unwrap();
        buf.truncate(HEADER_LEN + 3);
        let mut cursor = io::Cursor::new(buf);
        let err = Packet::decode(&mut cursor).unwrap_err();
        assert!(matches!(err, AdbError::Truncated));
    }

    #[test]
    fn freshly_built_and_decoded_packets_are_valid() {
        let pkt = Packet::new(A_WRTE, 1, 2, b"hello".to_vec());
        assert!(pkt.is_valid());
        let mut buf = Vec::new();
        pkt.encode(&mut buf).unwrap();
        let decoded = Packet::decode(&mut io::Cursor::new(buf)).unwrap();
        assert!(decoded.is_valid());
    }

    #[test]
    fn tampered_checksum_is_invalid() {
        let pkt = Packet::new(A_WRTE, 1, 2, b"hello".to_vec());
        let mut buf = Vec::new();
        pkt.encode(&mut buf).unwrap();
        buf[16] ^= 0xff; // flip a byte of data_checksum
        let decoded = Packet::decode(&mut io::Cursor::new(buf)).unwrap();
        assert!(!decoded.is_valid());
    }

    #[test]
    fn command_name_known_and_unknown() {
        assert_eq!(command_name(A_WRTE), "WRTE");
        assert_eq!(command_name(0xdead_beef), "0xdeadbeef");
    }
}
