//! Inter-node and client/daemon wire protocol (spec §4.1, §6.1).

pub mod body;
pub mod codec;
pub mod control;
pub mod header;

pub use body::{
    CallFlags, ConnectWaitReplyBody, RegisterBody, RegisterReplyBody, ReplyCallBody,
    ReplyControlBody, ReplyDmasterBody, ReplyErrorBody, ReplyRedirectBody, ReqCallBody,
    ReqControlBody, ReqDmasterBody, ReqMessageBody, CONTROL_FLAG_NOREPLY,
};
pub use codec::{CtdbCodec, Frame};
pub use control::ControlOpcode;
pub use header::{padded_len, Opcode, PacketHeader, CTDB_MAGIC, CTDB_VERSION, HEADER_LEN};
