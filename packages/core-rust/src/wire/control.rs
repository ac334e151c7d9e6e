//! The control-plane opcode space carried inside `REQ_CONTROL` (spec §4.10,
//! §6.4).

use crate::error::CtdbError;

/// Administrative control opcodes. Dispatch, per spec §9's "Dynamic
/// dispatch" note, is via a table keyed by this enum rather than a single
/// giant match (see `ctdbd::control::dispatch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ControlOpcode {
    Status = 0,
    Statistics = 1,
    GetVnnMap = 2,
    SetVnnMap = 3,
    GetDbMap = 4,
    GetDbPath = 5,
    GetNodeMap = 6,
    Freeze = 7,
    Thaw = 8,
    PullDb = 9,
    PushDb = 10,
    WipeDatabase = 11,
    SetDmaster = 12,
    SetRecMode = 13,
    GetRecMode = 14,
    Ping = 15,
    Ban = 16,
    Unban = 17,
    Stop = 18,
    Continue = 19,
    TakeoverIp = 20,
    ReleaseIp = 21,
    RegisterServerId = 22,
    ProcessExists = 23,
    GetTcpTickleList = 24,
    SetTcpTickleList = 25,
    GetTunable = 26,
    SetTunable = 27,
    ListTunables = 28,
    GetLog = 29,
    ClearLog = 30,
    DumpMemory = 31,
    RunEventscripts = 32,
    RegisterNotify = 33,
    DeregisterNotify = 34,
    DeleteRecord = 35,
}

impl ControlOpcode {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn try_from_u32(value: u32) -> Result<Self, CtdbError> {
        use ControlOpcode::*;
        Ok(match value {
            0 => Status,
            1 => Statistics,
            2 => GetVnnMap,
            3 => SetVnnMap,
            4 => GetDbMap,
            5 => GetDbPath,
            6 => GetNodeMap,
            7 => Freeze,
            8 => Thaw,
            9 => PullDb,
            10 => PushDb,
            11 => WipeDatabase,
            12 => SetDmaster,
            13 => SetRecMode,
            14 => GetRecMode,
            15 => Ping,
            16 => Ban,
            17 => Unban,
            18 => Stop,
            19 => Continue,
            20 => TakeoverIp,
            21 => ReleaseIp,
            22 => RegisterServerId,
            23 => ProcessExists,
            24 => GetTcpTickleList,
            25 => SetTcpTickleList,
            26 => GetTunable,
            27 => SetTunable,
            28 => ListTunables,
            29 => GetLog,
            30 => ClearLog,
            31 => DumpMemory,
            32 => RunEventscripts,
            33 => RegisterNotify,
            34 => DeregisterNotify,
            35 => DeleteRecord,
            other => {
                return Err(CtdbError::ProtocolViolation(format!(
                    "unknown control opcode {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_roundtrips_through_u32() {
        let all = [
            ControlOpcode::Status,
            ControlOpcode::Statistics,
            ControlOpcode::GetVnnMap,
            ControlOpcode::SetVnnMap,
            ControlOpcode::GetDbMap,
            ControlOpcode::GetDbPath,
            ControlOpcode::GetNodeMap,
            ControlOpcode::Freeze,
            ControlOpcode::Thaw,
            ControlOpcode::PullDb,
            ControlOpcode::PushDb,
            ControlOpcode::WipeDatabase,
            ControlOpcode::SetDmaster,
            ControlOpcode::SetRecMode,
            ControlOpcode::GetRecMode,
            ControlOpcode::Ping,
            ControlOpcode::Ban,
            ControlOpcode::Unban,
            ControlOpcode::Stop,
            ControlOpcode::Continue,
            ControlOpcode::TakeoverIp,
            ControlOpcode::ReleaseIp,
            ControlOpcode::RegisterServerId,
            ControlOpcode::ProcessExists,
            ControlOpcode::GetTcpTickleList,
            ControlOpcode::SetTcpTickleList,
            ControlOpcode::GetTunable,
            ControlOpcode::SetTunable,
            ControlOpcode::ListTunables,
            ControlOpcode::GetLog,
            ControlOpcode::ClearLog,
            ControlOpcode::DumpMemory,
            ControlOpcode::RunEventscripts,
            ControlOpcode::RegisterNotify,
            ControlOpcode::DeregisterNotify,
            ControlOpcode::DeleteRecord,
        ];
        for op in all {
            assert_eq!(ControlOpcode::try_from_u32(op.as_u32()).unwrap(), op);
        }
    }

    #[test]
    fn unknown_opcode_is_protocol_violation() {
        assert!(ControlOpcode::try_from_u32(9999).unwrap_err().is_fatal());
    }
}
