//! Daemon configuration: CLI flags and environment variables (ambient stack,
//! SPEC_FULL.md §2).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ctdb_core::tunables::Tunables;

/// `ctdbd` — clustered transactional database daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "ctdbd", version, about)]
pub struct DaemonConfig {
    /// This node's physical node number.
    #[arg(long, env = "CTDB_PNN")]
    pub pnn: u32,

    /// Path to the cluster node list (one `host:port` per line, index = pnn).
    #[arg(long, env = "CTDB_NODES_FILE", default_value = "/etc/ctdb/nodes")]
    pub nodes_file: PathBuf,

    /// Directory holding per-database files.
    #[arg(long, env = "CTDB_DB_DIR", default_value = "/var/lib/ctdb/volatile")]
    pub db_dir: PathBuf,

    /// Directory holding persistent per-database files.
    #[arg(long, env = "CTDB_DB_DIR_PERSISTENT", default_value = "/var/lib/ctdb/persistent")]
    pub db_dir_persistent: PathBuf,

    /// Local client socket path (spec §6.2).
    #[arg(long, env = "CTDB_SOCKET", default_value = "/tmp/ctdb.socket")]
    pub socket_path: PathBuf,

    /// Inter-node listen address (host:port).
    #[arg(long, env = "CTDB_LISTEN")]
    pub listen: Option<String>,

    /// `MaxRedirectCount`: redirect hop cap before forcing to the lmaster.
    #[arg(long, env = "CTDB_MAX_REDIRECT_COUNT")]
    pub max_redirect_count: Option<u32>,

    /// `MaxLACount`: consecutive-access threshold that triggers migration.
    #[arg(long, env = "CTDB_MAX_LACOUNT")]
    pub max_lacount: Option<u32>,

    /// Bounded queue depth above which message-type packets are dropped.
    #[arg(long, env = "CTDB_MAX_QUEUE_DEPTH_DROP_MSG")]
    pub max_queue_depth_drop_msg: Option<usize>,

    /// In-flight call request timeout in milliseconds. `0` means "use the
    /// compiled-in default" (spec §9).
    #[arg(long, env = "CTDB_REQ_TIMEOUT_MS", default_value_t = 0)]
    pub req_timeout_ms: u64,

    /// Vacuum interval in seconds.
    #[arg(long, env = "CTDB_VACUUM_INTERVAL_SECS", default_value_t = 10)]
    pub vacuum_interval_secs: u64,

    /// Freelist size above which vacuum triggers a repack.
    #[arg(long, env = "CTDB_VACUUM_REPACK_THRESHOLD")]
    pub vacuum_repack_threshold: Option<u64>,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "CTDB_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Bind address for the Prometheus metrics endpoint.
    #[arg(long, env = "CTDB_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

impl DaemonConfig {
    /// Resolves the compiled-in tunable defaults overridden by any flags
    /// the operator supplied.
    #[must_use]
    pub fn tunables(&self) -> Tunables {
        let mut t = Tunables::default();
        if let Some(v) = self.max_redirect_count {
            t.max_redirect_count = v;
        }
        if let Some(v) = self.max_lacount {
            t.max_lacount = v;
        }
        if let Some(v) = self.max_queue_depth_drop_msg {
            t.max_queue_depth_drop_msg = v;
        }
        if let Some(v) = self.vacuum_repack_threshold {
            t.vacuum_repack_threshold = v;
        }
        t.req_timeout = t.resolve_req_timeout(self.req_timeout_ms);
        t
    }

    #[must_use]
    pub fn vacuum_interval(&self) -> Duration {
        Duration::from_secs(self.vacuum_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunables_fall_back_to_defaults_when_unset() {
        let cfg = DaemonConfig::parse_from(["ctdbd", "--pnn", "0"]);
        let t = cfg.tunables();
        assert_eq!(t.max_redirect_count, Tunables::default().max_redirect_count);
    }

    #[test]
    fn explicit_overrides_are_applied() {
        let cfg = DaemonConfig::parse_from([
            "ctdbd",
            "--pnn",
            "0",
            "--max-redirect-count",
            "9",
            "--max-lacount",
            "2",
        ]);
        let t = cfg.tunables();
        assert_eq!(t.max_redirect_count, 9);
        assert_eq!(t.max_lacount, 2);
    }

    #[test]
    fn zero_req_timeout_resolves_to_default() {
        let cfg = DaemonConfig::parse_from(["ctdbd", "--pnn", "0"]);
        assert_eq!(cfg.tunables().req_timeout, Tunables::default().req_timeout);
    }
}
