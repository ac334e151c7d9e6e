//! Cluster-wide tunable defaults (spec §3, §4.5, §4.6, §4.9, §9).
//!
//! These are the compiled-in defaults; a running daemon may override them
//! via the `gettunable`/`settunable` controls (spec §4.10).

use std::time::Duration;

/// `CTDB_DEFAULT_MAX_LACOUNT`: the lacount threshold that triggers
/// migration of a hot record to its reader (spec §4.6 step 6).
pub const DEFAULT_MAX_LACOUNT: u32 = 7;

/// Default cap on redirect hops before a request is forced back to the
/// lmaster (spec §4.6 "Redirect chase policy").
pub const DEFAULT_MAX_REDIRECT_COUNT: u32 = 3;

/// Default number of database priority levels (spec §3 "priority
/// (1..NUM_DB_PRIORITIES)").
pub const NUM_DB_PRIORITIES: u32 = 3;

/// Default bounded-queue depth above which message-type packets are
/// dropped along with their connection (spec §4.2).
pub const DEFAULT_MAX_QUEUE_DEPTH_DROP_MSG: usize = 1000;

/// The lock coordinator's diagnostic timer period (spec §4.5).
pub const LOCK_DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(10);

/// Default record-freelist size above which vacuum triggers a repack
/// (spec §4.9).
pub const DEFAULT_VACUUM_REPACK_THRESHOLD: u64 = 10_000;

/// `CTDB_REQ_TIMEOUT` in the original header is defined as `0`. Per spec
/// §9's open-question resolution, a configured value of `0` means "use
/// this compiled-in default," not "wait forever."
pub const DEFAULT_REQ_TIMEOUT: Duration = Duration::from_secs(60);

/// Mutable, overridable tunables threaded through the daemon context.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub max_lacount: u32,
    pub max_redirect_count: u32,
    pub max_queue_depth_drop_msg: usize,
    pub vacuum_repack_threshold: u64,
    pub req_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_lacount: DEFAULT_MAX_LACOUNT,
            max_redirect_count: DEFAULT_MAX_REDIRECT_COUNT,
            max_queue_depth_drop_msg: DEFAULT_MAX_QUEUE_DEPTH_DROP_MSG,
            vacuum_repack_threshold: DEFAULT_VACUUM_REPACK_THRESHOLD,
            req_timeout: DEFAULT_REQ_TIMEOUT,
        }
    }
}

impl Tunables {
    /// Resolves a configured request timeout, honoring the "0 means use
    /// the default" rule (spec §9).
    #[must_use]
    pub fn resolve_req_timeout(&self, configured_ms: u64) -> Duration {
        if configured_ms == 0 {
            self.req_timeout
        } else {
            Duration::from_millis(configured_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_configured_timeout_uses_default() {
        let t = Tunables::default();
        assert_eq!(t.resolve_req_timeout(0), t.req_timeout);
    }

    #[test]
    fn nonzero_configured_timeout_is_honored() {
        let t = Tunables::default();
        assert_eq!(t.resolve_req_timeout(5000), Duration::from_millis(5000));
    }
}
