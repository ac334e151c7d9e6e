//! The fixed 32-byte packet header (spec §4.1, §6.1).

use crate::error::CtdbError;
use crate::node::Pnn;

/// `magic = 0x43544442` ("CTDB" in ASCII, big-endian reading).
pub const CTDB_MAGIC: u32 = 0x4354_4442;

/// The single supported wire version.
pub const CTDB_VERSION: u32 = 1;

/// Size in bytes of the fixed header.
pub const HEADER_LEN: usize = 32;

/// Operation codes, spec §6.1. Values 1000+ are client-socket-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    ReqCall = 0,
    ReplyCall = 1,
    ReplyRedirect = 2,
    ReqDmaster = 3,
    ReplyDmaster = 4,
    ReplyError = 5,
    ReqMessage = 6,
    ReqFinished = 7,
    ReqControl = 8,
    ReplyControl = 9,
    Register = 1000,
    ConnectWait = 1001,
    Shutdown = 1002,
}

impl Opcode {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether this opcode is one of the four migration opcodes that are
    /// fenced by generation (spec §4.1, §8 invariant 3).
    #[must_use]
    pub fn is_generation_fenced(self) -> bool {
        matches!(
            self,
            Opcode::ReqCall | Opcode::ReplyCall | Opcode::ReqDmaster | Opcode::ReplyDmaster
        )
    }

    pub fn try_from_u32(value: u32) -> Result<Self, CtdbError> {
        Ok(match value {
            0 => Opcode::ReqCall,
            1 => Opcode::ReplyCall,
            2 => Opcode::ReplyRedirect,
            3 => Opcode::ReqDmaster,
            4 => Opcode::ReplyDmaster,
            5 => Opcode::ReplyError,
            6 => Opcode::ReqMessage,
            7 => Opcode::ReqFinished,
            8 => Opcode::ReqControl,
            9 => Opcode::ReplyControl,
            1000 => Opcode::Register,
            1001 => Opcode::ConnectWait,
            1002 => Opcode::Shutdown,
            other => {
                return Err(CtdbError::ProtocolViolation(format!(
                    "unknown operation code {other}"
                )))
            }
        })
    }
}

/// The fixed header prefixing every packet (spec §4.1, §6.1): 8 native-endian
/// `u32` fields, 32 bytes total, no padding of its own (the body that
/// follows is padded, not the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total length of header + body, including body padding.
    pub length: u32,
    pub generation: u32,
    pub operation: Opcode,
    pub destnode: Pnn,
    pub srcnode: Pnn,
    pub reqid: u32,
}

impl PacketHeader {
    #[must_use]
    pub fn new(operation: Opcode, generation: u32, destnode: Pnn, srcnode: Pnn, reqid: u32) -> Self {
        Self { length: HEADER_LEN as u32, generation, operation, destnode, srcnode, reqid }
    }

    /// Encodes the header into exactly [`HEADER_LEN`] bytes, native byte
    /// order (spec §6.1: "all multi-byte integers are host-byte-order; the
    /// cluster is assumed homogeneous").
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_ne_bytes());
        out.extend_from_slice(&CTDB_MAGIC.to_ne_bytes());
        out.extend_from_slice(&CTDB_VERSION.to_ne_bytes());
        out.extend_from_slice(&self.generation.to_ne_bytes());
        out.extend_from_slice(&self.operation.as_u32().to_ne_bytes());
        out.extend_from_slice(&self.destnode.to_ne_bytes());
        out.extend_from_slice(&self.srcnode.to_ne_bytes());
        out.extend_from_slice(&self.reqid.to_ne_bytes());
    }

    /// Decodes a header from exactly [`HEADER_LEN`] bytes. A malformed
    /// length, bad magic, or wrong version is a protocol violation: per
    /// spec §4.1 the connection must be treated as dead.
    pub fn decode(bytes: &[u8]) -> Result<Self, CtdbError> {
        if bytes.len() < HEADER_LEN {
            return Err(CtdbError::ProtocolViolation("short header".into()));
        }
        let read_u32 = |offset: usize| -> u32 {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_ne_bytes(buf)
        };
        let length = read_u32(0);
        let magic = read_u32(4);
        let version = read_u32(8);
        if magic != CTDB_MAGIC {
            return Err(CtdbError::ProtocolViolation(format!("bad magic {magic:#x}")));
        }
        if version != CTDB_VERSION {
            return Err(CtdbError::ProtocolViolation(format!("unsupported version {version}")));
        }
        if (length as usize) < HEADER_LEN {
            return Err(CtdbError::ProtocolViolation(format!(
                "length {length} shorter than header"
            )));
        }
        let generation = read_u32(12);
        let operation = Opcode::try_from_u32(read_u32(16))?;
        let destnode = read_u32(20);
        let srcnode = read_u32(24);
        let reqid = read_u32(28);
        Ok(Self { length, generation, operation, destnode, srcnode, reqid })
    }
}

/// Rounds `len` up to the next 8-byte boundary (spec §4.1 "padded to 8-byte
/// boundaries and the length field is rewritten to the padded value").
#[must_use]
pub fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let h = PacketHeader::new(Opcode::ReqCall, 7, 2, 1, 55);
        let mut buf = Vec::new();
        h.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn bad_magic_is_protocol_violation() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_ne_bytes());
        let err = PacketHeader::decode(&buf).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn bad_version_is_protocol_violation() {
        let h = PacketHeader::new(Opcode::ReqCall, 0, 0, 0, 0);
        let mut buf = Vec::new();
        h.encode_into(&mut buf);
        buf[8..12].copy_from_slice(&99u32.to_ne_bytes());
        assert!(PacketHeader::decode(&buf).unwrap_err().is_fatal());
    }

    #[test]
    fn migration_opcodes_are_generation_fenced() {
        assert!(Opcode::ReqCall.is_generation_fenced());
        assert!(Opcode::ReplyCall.is_generation_fenced());
        assert!(Opcode::ReqDmaster.is_generation_fenced());
        assert!(Opcode::ReplyDmaster.is_generation_fenced());
        assert!(!Opcode::ReqControl.is_generation_fenced());
        assert!(!Opcode::ReplyRedirect.is_generation_fenced());
    }

    #[test]
    fn padding_rounds_up_to_8() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 8);
        assert_eq!(padded_len(8), 8);
        assert_eq!(padded_len(9), 16);
    }
}
