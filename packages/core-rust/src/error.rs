//! Error taxonomy (spec §7). Every fault the core produces is one of these
//! seven kinds; nothing else crosses a call/control reply boundary.

use thiserror::Error;

/// The seven error categories of spec §7, carried as the payload of
/// `REPLY_ERROR` / a failing `REPLY_CONTROL`, or used internally to decide
/// whether an operation should be requeued, failed, or treated as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CtdbError {
    /// Would-block on a record lock, queue below drop threshold, or
    /// temporary transport back-pressure. Callers requeue rather than fail.
    #[error("transient: {0}")]
    Transient(String),

    /// An in-flight call or control exceeded its budget.
    #[error("timeout")]
    Timeout,

    /// A peer reported `REPLY_ERROR` / a failing control reply; surfaced
    /// verbatim to the originating caller.
    #[error("remote error: {0}")]
    Remote(String),

    /// Packet generation did not match the receiver's current vnn_map
    /// generation; the packet is dropped, not failed (spec §4.1, §7).
    #[error("generation mismatch: packet={packet}, local={local}")]
    GenerationMismatch { packet: u32, local: u32 },

    /// Bad magic, bad version, mismatched length, or an lmaster receiving a
    /// dmaster proposal from a non-dmaster with rsn != 0. Fatal: the
    /// receiving daemon aborts the connection (or itself) rather than risk
    /// corrupting data.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Allocation or queue-capacity failure. Fatal during packet
    /// construction; reported as a call error during steady-state call
    /// execution.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// A record lock has not been obtained within the diagnostic window.
    /// Logged, not fatal; acquisition keeps retrying.
    #[error("lock diagnostic: held for {seconds}s on {key}")]
    LockDiagnostic { key: String, seconds: u64 },
}

impl CtdbError {
    /// Whether the failing operation should be requeued rather than failed
    /// outright (spec §7 "Transient ... is requeued, not failed").
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, CtdbError::Transient(_))
    }

    /// Whether this error is fatal to the connection or daemon (spec §7
    /// "Protocol violation ... fatal").
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CtdbError::ProtocolViolation(_))
    }

    /// The wire status code sent back on a failing reply. Matches the
    /// convention that 0 is success and negative values are errors, as in
    /// the original `CTDB_ERR_*` constants.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            CtdbError::Transient(_) => -1,
            CtdbError::Timeout => -2,
            CtdbError::Remote(_) => -3,
            CtdbError::GenerationMismatch { .. } => -4,
            CtdbError::ProtocolViolation(_) => -5,
            CtdbError::ResourceExhaustion(_) => -6,
            CtdbError::LockDiagnostic { .. } => -7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_requeued_not_failed() {
        assert!(CtdbError::Transient("lock busy".into()).is_transient());
        assert!(!CtdbError::Timeout.is_transient());
    }

    #[test]
    fn protocol_violation_is_fatal() {
        assert!(CtdbError::ProtocolViolation("bad magic".into()).is_fatal());
        assert!(!CtdbError::Timeout.is_fatal());
    }

    #[test]
    fn status_codes_are_distinct() {
        let codes = [
            CtdbError::Transient(String::new()).status_code(),
            CtdbError::Timeout.status_code(),
            CtdbError::Remote(String::new()).status_code(),
            CtdbError::GenerationMismatch { packet: 0, local: 0 }.status_code(),
            CtdbError::ProtocolViolation(String::new()).status_code(),
            CtdbError::ResourceExhaustion(String::new()).status_code(),
            CtdbError::LockDiagnostic { key: String::new(), seconds: 0 }.status_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }
}
