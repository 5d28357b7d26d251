//! Code-level configuration surface. No file-format parsing is implemented
//! here (that remains out of scope) — these structs are the seam a caller
//! wires a config-file loader into.

use crate::error::{RaftError, Result};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Flush the current batch once it reaches this many bytes.
    pub max_batch_bytes: usize,
    /// Flush the current batch once it holds this many records.
    pub max_batch_records: usize,
    /// Flush the current batch once its oldest record is this old.
    pub max_batch_delay: Duration,
    /// Seal the current WAL file once it reaches this size.
    pub rollover_size_bytes: u64,
    /// Depth of the bounded append channel; back-pressures callers.
    pub append_queue_depth: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            max_batch_bytes: 4 * 1024 * 1024,
            max_batch_records: 2048,
            max_batch_delay: Duration::from_millis(10),
            rollover_size_bytes: 64 * 1024 * 1024,
            append_queue_depth: 8192,
        }
    }
}

impl WalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_bytes == 0 || self.max_batch_records == 0 {
            return Err(RaftError::InvalidConfig("wal batch thresholds must be > 0".into()));
        }
        if self.rollover_size_bytes < self.max_batch_bytes as u64 {
            return Err(RaftError::InvalidConfig(
                "wal rollover_size_bytes must be >= max_batch_bytes".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SegmentConfig {
    /// Seal a group's open segment once it reaches this size.
    pub rollover_size_bytes: u64,
    /// Seal a group's open segment once it spans this many indexes.
    pub rollover_index_span: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            rollover_size_bytes: 32 * 1024 * 1024,
            rollover_index_span: 100_000,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rollover_size_bytes == 0 || self.rollover_index_span == 0 {
            return Err(RaftError::InvalidConfig("segment rollover thresholds must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RaftTimingConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub max_entries_per_append: usize,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        RaftTimingConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 256,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

impl RaftTimingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be < election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be < election_timeout_min".into(),
            ));
        }
        Ok(())
    }
}

/// Tunables for the single-server membership-change verification protocol.
#[derive(Clone, Copy, Debug)]
pub struct MembershipConfig {
    pub verification_tick: Duration,
    pub verification_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            verification_tick: Duration::from_secs(5),
            verification_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub wal: WalConfig,
    pub segment: SegmentConfig,
    pub raft_timing: RaftTimingConfig,
    pub membership: MembershipConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        self.wal.validate()?;
        self.segment.validate()?;
        self.raft_timing.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_election_bounds() {
        let mut cfg = RaftTimingConfig::default();
        cfg.election_timeout_min = Duration::from_millis(500);
        cfg.election_timeout_max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());
    }
}
