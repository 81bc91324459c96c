//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default fraction of the election timeout lower bound used as the heartbeat interval.
pub const DEFAULT_HEARTBEAT_THRESHOLD: f64 = 0.5;
/// Default threshold for entry replication lag triggering a transition to lagging state.
pub const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default snapshot chunk size, in bytes.
pub const DEFAULT_SNAPSHOT_CHUNKSIZE: u64 = 1024 * 1024 * 3;
/// Default timeout for sending a single snapshot segment, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default tolerated clock drift factor for leadership-lease checks.
pub const DEFAULT_CLOCK_DRIFT_BOUND: f64 = 1.0;

/// The policy governing when to trigger a snapshot of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(5000)
    }
}

/// The backoff schedule applied by a leader's per-peer replication loop when the
/// peer is unreachable. Once the cap is reached the peer continues to be probed
/// at heartbeat cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBackoff {
    /// Delay before the first retry, in milliseconds.
    pub initial: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max: u64,
    /// Multiplier applied to the delay after each consecutive failure.
    pub multiplier: f64,
}

impl Default for ReplicationBackoff {
    fn default() -> Self {
        Self {
            initial: 50,
            max: 1000,
            multiplier: 2.0,
        }
    }
}

/// Errors produced when validating a config.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeout values do not form a valid range.
    #[error("given values for election timeout min & max do not form a valid range")]
    InvalidElectionTimeoutMinMax,

    /// The heartbeat threshold must lie strictly between 0 and 1.
    #[error("heartbeat threshold must be in the open interval (0, 1)")]
    InvalidHeartbeatThreshold,

    /// The clock drift bound must be at least 1.0.
    #[error("clock drift bound must be >= 1.0")]
    InvalidClockDriftBound,

    /// The max payload entries must be greater than 0.
    #[error("max payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

/// The runtime configuration for a Raft node.
///
/// Instances are created with the builder: `Config::build("cluster".into())
/// .election_timeout(150, 300).validate()`. The `validate` call derives the
/// heartbeat interval from the election timeout lower bound and the heartbeat
/// threshold, and rejects inconsistent settings.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The fraction of the election timeout lower bound used as the heartbeat interval.
    pub heartbeat_threshold: f64,
    /// The interval at which leaders send heartbeats, in milliseconds. Derived.
    pub heartbeat_interval: u64,
    /// The tolerated clock drift factor applied when verifying leadership liveness.
    pub clock_drift_bound: f64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// Distance behind in log replication before the target is considered lagging.
    pub replication_lag_threshold: u64,
    /// The snapshot policy.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size, in bytes.
    pub snapshot_max_chunk_size: u64,
    /// The timeout for sending a single snapshot segment, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// The retry schedule for replication to an unreachable peer.
    pub replication_backoff: ReplicationBackoff,
    /// A standby node replicates the log but refuses to ever become candidate.
    pub standby: bool,
    /// A sticky follower refuses to pre-vote for a challenger while its current
    /// leader is still heartbeating within the election timeout.
    pub aggressive_leader_stickiness: bool,
    /// Allow minority partitions to keep campaigning. When `false`, a candidate
    /// that cannot reach a quorum of peers reverts to follower instead of
    /// driving up its term in a partition.
    pub partitioning: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_threshold: None,
            clock_drift_bound: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
            replication_backoff: None,
            standby: None,
            aggressive_leader_stickiness: None,
            partitioning: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for a `Config` instance.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_threshold: Option<f64>,
    clock_drift_bound: Option<f64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_max_chunk_size: Option<u64>,
    install_snapshot_timeout: Option<u64>,
    replication_backoff: Option<ReplicationBackoff>,
    standby: Option<bool>,
    aggressive_leader_stickiness: Option<bool>,
    partitioning: Option<bool>,
}

impl ConfigBuilder {
    /// Set the election timeout bounds, in milliseconds.
    pub fn election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = Some(min);
        self.election_timeout_max = Some(max);
        self
    }

    /// Set the heartbeat threshold, in the open interval (0, 1).
    pub fn heartbeat_threshold(mut self, threshold: f64) -> Self {
        self.heartbeat_threshold = Some(threshold);
        self
    }

    /// Set the clock drift bound. Must be >= 1.0.
    pub fn clock_drift_bound(mut self, bound: f64) -> Self {
        self.clock_drift_bound = Some(bound);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, max: u64) -> Self {
        self.max_payload_entries = Some(max);
        self
    }

    /// Set the replication lag threshold.
    pub fn replication_lag_threshold(mut self, threshold: u64) -> Self {
        self.replication_lag_threshold = Some(threshold);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(policy);
        self
    }

    /// Set the maximum snapshot chunk size.
    pub fn snapshot_max_chunk_size(mut self, size: u64) -> Self {
        self.snapshot_max_chunk_size = Some(size);
        self
    }

    /// Set the timeout for sending a single snapshot segment.
    pub fn install_snapshot_timeout(mut self, timeout_millis: u64) -> Self {
        self.install_snapshot_timeout = Some(timeout_millis);
        self
    }

    /// Set the replication retry backoff schedule.
    pub fn replication_backoff(mut self, backoff: ReplicationBackoff) -> Self {
        self.replication_backoff = Some(backoff);
        self
    }

    /// Configure this node as a standby.
    pub fn standby(mut self, standby: bool) -> Self {
        self.standby = Some(standby);
        self
    }

    /// Configure leader stickiness for pre-vote handling.
    pub fn aggressive_leader_stickiness(mut self, sticky: bool) -> Self {
        self.aggressive_leader_stickiness = Some(sticky);
        self
    }

    /// Allow minority partitions to keep campaigning.
    pub fn partitioning(mut self, partitioning: bool) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    /// Validate the state of this builder & produce a new `Config` instance.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }

        let heartbeat_threshold = self.heartbeat_threshold.unwrap_or(DEFAULT_HEARTBEAT_THRESHOLD);
        if heartbeat_threshold <= 0.0 || heartbeat_threshold >= 1.0 {
            return Err(ConfigError::InvalidHeartbeatThreshold);
        }
        let heartbeat_interval = ((election_timeout_min as f64) * heartbeat_threshold) as u64;

        let clock_drift_bound = self.clock_drift_bound.unwrap_or(DEFAULT_CLOCK_DRIFT_BOUND);
        if clock_drift_bound < 1.0 {
            return Err(ConfigError::InvalidClockDriftBound);
        }

        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_threshold,
            heartbeat_interval,
            clock_drift_bound,
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD),
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNKSIZE),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
            replication_backoff: self.replication_backoff.unwrap_or_default(),
            standby: self.standby.unwrap_or(false),
            aggressive_leader_stickiness: self.aggressive_leader_stickiness.unwrap_or(false),
            partitioning: self.partitioning.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, 75);
        assert!(!cfg.standby);
        assert!(cfg.partitioning);
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let res = Config::build("test".into()).election_timeout(300, 150).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));

        let res = Config::build("test".into()).election_timeout(150, 150).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn test_heartbeat_derived_from_threshold() {
        let cfg = Config::build("test".into())
            .election_timeout(200, 400)
            .heartbeat_threshold(0.25)
            .validate()
            .unwrap();
        assert_eq!(cfg.heartbeat_interval, 50);
    }

    #[test]
    fn test_invalid_heartbeat_threshold() {
        for t in &[0.0, 1.0, 1.5] {
            let res = Config::build("test".into()).heartbeat_threshold(*t).validate();
            assert!(matches!(res, Err(ConfigError::InvalidHeartbeatThreshold)));
        }
    }

    #[test]
    fn test_rand_election_timeout_within_bounds() {
        let cfg = Config::build("test".into()).election_timeout(100, 200).validate().unwrap();
        for _ in 0..64 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..200).contains(&t));
        }
    }
}
