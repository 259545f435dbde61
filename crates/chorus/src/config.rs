//! Node configuration: every knob loadable from CLI flags (`clap` derive)
//! with environment-variable overrides for container deployment, following
//! CLI > env > default precedence (`clap`'s `env` feature gives us this for
//! free: an explicit flag always wins over the variable).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "chorus-node", about = "A node in a chorus cluster")]
pub struct NodeConfig {
    /// Directory holding this node's range store, journal, and lock file.
    #[arg(long, env = "CHORUS_DIR", default_value = "./data")]
    pub dir: PathBuf,

    /// Bytes per audio chunk.
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1 << 20)]
    pub chunk_size: u64,

    /// Number of ranges to split each file into at upload (`p`).
    #[arg(long, env = "CHUNK_RANGES", default_value_t = 4)]
    pub chunk_ranges: u64,

    /// Target DB quorum size including leader; also the shard replication
    /// factor (`k`).
    #[arg(long, env = "DB_REPLICATION_FACTOR", default_value_t = 3)]
    pub db_replication_factor: usize,

    /// Monitoring cycle period, in milliseconds.
    #[arg(long, env = "NODE_CHECK_INTERVAL_MS", default_value_t = 2500)]
    pub node_check_interval_ms: u64,

    /// Lower bound of the randomized election timeout, in milliseconds.
    #[arg(long, env = "ELECTION_TIMEOUT_MIN_MS", default_value_t = 3000)]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout, in milliseconds.
    #[arg(long, env = "ELECTION_TIMEOUT_MAX_MS", default_value_t = 7000)]
    pub election_timeout_max_ms: u64,

    /// Lower bound of the randomized heartbeat period, in milliseconds.
    #[arg(long, env = "HEARTBEAT_MIN_MS", default_value_t = 1000)]
    pub heartbeat_min_ms: u64,

    /// Upper bound of the randomized heartbeat period, in milliseconds.
    #[arg(long, env = "HEARTBEAT_MAX_MS", default_value_t = 2900)]
    pub heartbeat_max_ms: u64,

    /// Outbound RPC deadline, in milliseconds.
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 5000)]
    pub rpc_timeout_ms: u64,

    /// DNS name queried by the peer directory (`tasks.<SERVICE_NAME>`).
    #[arg(long, env = "SERVICE_NAME", default_value = "chorus")]
    pub service_name: String,

    /// TCP port this node's peer RPC server listens on.
    #[arg(long, env = "CHORUS_PORT", default_value_t = 7400)]
    pub port: u16,
}

impl NodeConfig {
    pub fn node_check_interval(&self) -> Duration {
        Duration::from_millis(self.node_check_interval_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.heartbeat_min_ms),
            Duration::from_millis(self.heartbeat_max_ms),
        )
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// `k` in the specification: target replication factor for both DB
    /// quorum membership and file shard replicas.
    pub fn replication_factor(&self) -> usize {
        self.db_replication_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_args() {
        let cfg = NodeConfig::parse_from(["chorus-node"]);
        assert_eq!(cfg.chunk_ranges, 4);
        assert_eq!(cfg.db_replication_factor, 3);
        assert_eq!(cfg.service_name, "chorus");
    }

    #[test]
    fn explicit_flag_overrides_default() {
        let cfg = NodeConfig::parse_from(["chorus-node", "--db-replication-factor", "5"]);
        assert_eq!(cfg.db_replication_factor, 5);
    }
}
