//! Operation-specific packet bodies (spec §6.1 table) and the call-flag
//! bitset used by `REQ_CALL`.

use bitflags::bitflags;

use crate::error::CtdbError;
use crate::node::Pnn;
use crate::record::RecordFlags;

bitflags! {
    /// `REQ_CALL` flags. Distinct from the record header's own
    /// [`RecordFlags`](crate::record::RecordFlags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallFlags: u32 {
        /// Caller requests migration regardless of the laccessor/lacount
        /// heuristic (spec §4.6 step 6).
        const IMMEDIATE_MIGRATION = 0x0000_0001;
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32, CtdbError> {
        if self.pos + 4 > self.buf.len() {
            return Err(CtdbError::ProtocolViolation("truncated body (u32)".into()));
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_ne_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, CtdbError> {
        if self.pos + 8 > self.buf.len() {
            return Err(CtdbError::ProtocolViolation("truncated body (u64)".into()));
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_ne_bytes(b))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, CtdbError> {
        if self.pos + len > self.buf.len() {
            return Err(CtdbError::ProtocolViolation("truncated body (bytes)".into()));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

/// Body of `REQ_CALL`: flags, db_id, call_id, hopcount, keylen, calldatalen,
/// key‖call_data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqCallBody {
    pub flags: CallFlags,
    pub db_id: u32,
    pub call_id: u32,
    pub hopcount: u32,
    pub key: Vec<u8>,
    pub call_data: Vec<u8>,
}

impl ReqCallBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.flags.bits());
        write_u32(&mut out, self.db_id);
        write_u32(&mut out, self.call_id);
        write_u32(&mut out, self.hopcount);
        write_u32(&mut out, self.key.len() as u32);
        write_u32(&mut out, self.call_data.len() as u32);
        write_bytes(&mut out, &self.key);
        write_bytes(&mut out, &self.call_data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let flags = CallFlags::from_bits_truncate(r.u32()?);
        let db_id = r.u32()?;
        let call_id = r.u32()?;
        let hopcount = r.u32()?;
        let keylen = r.u32()? as usize;
        let datalen = r.u32()? as usize;
        let key = r.bytes(keylen)?;
        let call_data = r.bytes(datalen)?;
        Ok(Self { flags, db_id, call_id, hopcount, key, call_data })
    }
}

/// Body of `REPLY_CALL`: status, datalen, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCallBody {
    pub status: i32,
    pub data: Vec<u8>,
}

impl ReplyCallBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.status as u32);
        write_u32(&mut out, self.data.len() as u32);
        write_bytes(&mut out, &self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let status = r.u32()? as i32;
        let datalen = r.u32()? as usize;
        let data = r.bytes(datalen)?;
        Ok(Self { status, data })
    }
}

/// Body of `REPLY_REDIRECT`: the hinted dmaster to retry against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRedirectBody {
    pub dmaster: Pnn,
}

impl ReplyRedirectBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.dmaster);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        Ok(Self { dmaster: r.u32()? })
    }
}

/// Body of `REQ_DMASTER`: db_id, proposed dmaster, current rsn, flags,
/// keylen, datalen, key‖value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqDmasterBody {
    pub db_id: u32,
    pub dmaster: Pnn,
    pub rsn: u64,
    pub flags: RecordFlags,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ReqDmasterBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.db_id);
        write_u32(&mut out, self.dmaster);
        write_u64(&mut out, self.rsn);
        write_u32(&mut out, self.flags.bits());
        write_u32(&mut out, self.key.len() as u32);
        write_u32(&mut out, self.value.len() as u32);
        write_bytes(&mut out, &self.key);
        write_bytes(&mut out, &self.value);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let db_id = r.u32()?;
        let dmaster = r.u32()?;
        let rsn = r.u64()?;
        let flags = RecordFlags::from_bits_truncate(r.u32()?);
        let keylen = r.u32()? as usize;
        let datalen = r.u32()? as usize;
        let key = r.bytes(keylen)?;
        let value = r.bytes(datalen)?;
        Ok(Self { db_id, dmaster, rsn, flags, key, value })
    }
}

/// Body of `REPLY_DMASTER`: rsn, keylen, datalen, db_id, key‖value‖flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDmasterBody {
    pub rsn: u64,
    pub db_id: u32,
    pub flags: RecordFlags,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ReplyDmasterBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, self.rsn);
        write_u32(&mut out, self.key.len() as u32);
        write_u32(&mut out, self.value.len() as u32);
        write_u32(&mut out, self.db_id);
        write_u32(&mut out, self.flags.bits());
        write_bytes(&mut out, &self.key);
        write_bytes(&mut out, &self.value);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let rsn = r.u64()?;
        let keylen = r.u32()? as usize;
        let datalen = r.u32()? as usize;
        let db_id = r.u32()?;
        let flags = RecordFlags::from_bits_truncate(r.u32()?);
        let key = r.bytes(keylen)?;
        let value = r.bytes(datalen)?;
        Ok(Self { rsn, db_id, flags, key, value })
    }
}

/// Body of `REPLY_ERROR`: status, msglen, msg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyErrorBody {
    pub status: i32,
    pub message: String,
}

impl ReplyErrorBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let msg = self.message.as_bytes();
        write_u32(&mut out, self.status as u32);
        write_u32(&mut out, msg.len() as u32);
        write_bytes(&mut out, msg);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let status = r.u32()? as i32;
        let msglen = r.u32()? as usize;
        let msg = r.bytes(msglen)?;
        let message = String::from_utf8_lossy(&msg).into_owned();
        Ok(Self { status, message })
    }
}

/// Body of `REQ_MESSAGE`: srvid, datalen, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqMessageBody {
    pub srvid: u64,
    pub data: Vec<u8>,
}

impl ReqMessageBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, self.srvid);
        write_u32(&mut out, self.data.len() as u32);
        write_bytes(&mut out, &self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let srvid = r.u64()?;
        let datalen = r.u32()? as usize;
        let data = r.bytes(datalen)?;
        Ok(Self { srvid, data })
    }
}

/// Body of `REQ_CONTROL`: opcode, srvid, flags, datalen, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqControlBody {
    pub opcode: u32,
    pub srvid: u64,
    pub flags: u32,
    pub data: Vec<u8>,
}

/// A `REQ_CONTROL` flag requesting fire-and-forget delivery (spec §4.10
/// "A `NOREPLY` flag fires-and-forgets").
pub const CONTROL_FLAG_NOREPLY: u32 = 0x0000_0001;

impl ReqControlBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.opcode);
        write_u64(&mut out, self.srvid);
        write_u32(&mut out, self.flags);
        write_u32(&mut out, self.data.len() as u32);
        write_bytes(&mut out, &self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let opcode = r.u32()?;
        let srvid = r.u64()?;
        let flags = r.u32()?;
        let datalen = r.u32()? as usize;
        let data = r.bytes(datalen)?;
        Ok(Self { opcode, srvid, flags, data })
    }

    #[must_use]
    pub fn is_noreply(&self) -> bool {
        self.flags & CONTROL_FLAG_NOREPLY != 0
    }
}

/// Body of `REPLY_CONTROL`: status, datalen, errorlen, data‖error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyControlBody {
    pub status: i32,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl ReplyControlBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let error_bytes = self.error.as_deref().unwrap_or("").as_bytes().to_vec();
        write_u32(&mut out, self.status as u32);
        write_u32(&mut out, self.data.len() as u32);
        write_u32(&mut out, error_bytes.len() as u32);
        write_bytes(&mut out, &self.data);
        write_bytes(&mut out, &error_bytes);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let status = r.u32()? as i32;
        let datalen = r.u32()? as usize;
        let errorlen = r.u32()? as usize;
        let data = r.bytes(datalen)?;
        let error_bytes = r.bytes(errorlen)?;
        let error = if error_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&error_bytes).into_owned())
        };
        Ok(Self { status, data, error })
    }
}

/// Body of the client-only `REGISTER`: attaches a database by name (spec
/// §6.2 "attaches databases by name").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBody {
    pub persistent: bool,
    pub name: String,
}

impl RegisterBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let name = self.name.as_bytes();
        write_u32(&mut out, u32::from(self.persistent));
        write_u32(&mut out, name.len() as u32);
        write_bytes(&mut out, name);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let persistent = r.u32()? != 0;
        let namelen = r.u32()? as usize;
        let name = String::from_utf8_lossy(&r.bytes(namelen)?).into_owned();
        Ok(Self { persistent, name })
    }
}

/// Reply to `REGISTER`: the attached database's id and on-disk path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReplyBody {
    pub db_id: u32,
    pub path: String,
}

impl RegisterReplyBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let path = self.path.as_bytes();
        write_u32(&mut out, self.db_id);
        write_u32(&mut out, path.len() as u32);
        write_bytes(&mut out, path);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        let db_id = r.u32()?;
        let pathlen = r.u32()? as usize;
        let path = String::from_utf8_lossy(&r.bytes(pathlen)?).into_owned();
        Ok(Self { db_id, path })
    }
}

/// Reply to `CONNECT_WAIT`: this node's pnn (spec §6.2 "the client obtains
/// its pnn via CONNECT_WAIT").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectWaitReplyBody {
    pub pnn: Pnn,
}

impl ConnectWaitReplyBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.pnn);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CtdbError> {
        let mut r = Reader::new(buf);
        Ok(Self { pnn: r.u32()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_call_body_roundtrips() {
        let body = ReqCallBody {
            flags: CallFlags::IMMEDIATE_MIGRATION,
            db_id: 7,
            call_id: 1,
            hopcount: 0,
            key: b"key1".to_vec(),
            call_data: b"payload".to_vec(),
        };
        let encoded = body.encode();
        assert_eq!(ReqCallBody::decode(&encoded).unwrap(), body);
    }

    #[test]
    fn reply_call_body_roundtrips() {
        let body = ReplyCallBody { status: 0, data: b"ok".to_vec() };
        assert_eq!(ReplyCallBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn reply_redirect_body_roundtrips() {
        let body = ReplyRedirectBody { dmaster: 9 };
        assert_eq!(ReplyRedirectBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn req_dmaster_body_roundtrips() {
        let body = ReqDmasterBody {
            db_id: 1,
            dmaster: 2,
            rsn: 42,
            flags: RecordFlags::MIGRATED_WITH_DATA,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(ReqDmasterBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn reply_dmaster_body_roundtrips() {
        let body = ReplyDmasterBody {
            rsn: 7,
            db_id: 3,
            flags: RecordFlags::empty(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(ReplyDmasterBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn reply_error_body_roundtrips() {
        let body = ReplyErrorBody { status: -5, message: "bad db".into() };
        assert_eq!(ReplyErrorBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn req_message_body_roundtrips() {
        let body = ReqMessageBody { srvid: 0xABCD, data: b"evt".to_vec() };
        assert_eq!(ReqMessageBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn req_control_body_roundtrips_and_detects_noreply() {
        let body = ReqControlBody {
            opcode: 5,
            srvid: 0,
            flags: CONTROL_FLAG_NOREPLY,
            data: b"x".to_vec(),
        };
        let decoded = ReqControlBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded, body);
        assert!(decoded.is_noreply());
    }

    #[test]
    fn reply_control_body_roundtrips_with_and_without_error() {
        let ok = ReplyControlBody { status: 0, data: b"v".to_vec(), error: None };
        assert_eq!(ReplyControlBody::decode(&ok.encode()).unwrap(), ok);

        let err = ReplyControlBody { status: -1, data: vec![], error: Some("nope".into()) };
        assert_eq!(ReplyControlBody::decode(&err.encode()).unwrap(), err);
    }

    #[test]
    fn truncated_body_is_protocol_violation() {
        let err = ReqCallBody::decode(&[0, 0]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn register_body_roundtrips() {
        let body = RegisterBody { persistent: true, name: "locking.tdb".into() };
        assert_eq!(RegisterBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn register_reply_body_roundtrips() {
        let body = RegisterReplyBody { db_id: 7, path: "/var/lib/ctdb/volatile/locking.tdb".into() };
        assert_eq!(RegisterReplyBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn connect_wait_reply_body_roundtrips() {
        let body = ConnectWaitReplyBody { pnn: 3 };
        assert_eq!(ConnectWaitReplyBody::decode(&body.encode()).unwrap(), body);
    }
}
