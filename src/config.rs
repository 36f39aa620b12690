//! Runtime configuration for the core
//!
//! The core does not parse any configuration file. The embedding process
//! reads its own configuration and pushes values in through the setters
//! here. Values are validated on the way in so the state machines can rely
//! on them without re-checking.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{HsError, Result};
use crate::hs::time_period::{TIME_PERIOD_LENGTH_MAX, TIME_PERIOD_LENGTH_MIN};

/// Nominal consensus voting interval in seconds.
pub const DEFAULT_VOTING_INTERVAL_SECS: u64 = 3600;

/// Number of intro points a service maintains by default.
pub const DEFAULT_NUM_INTRO_POINTS: u8 = 3;

/// Upper bound on intro points per service.
pub const MAX_NUM_INTRO_POINTS: u8 = 10;

/// Default number of HSDir replicas on the hash ring.
pub const DEFAULT_HSDIR_N_REPLICAS: u64 = 2;

/// Default number of HSDirs a service uploads to, per replica.
pub const DEFAULT_HSDIR_SPREAD_STORE: usize = 3;

/// Default number of HSDirs a client considers when fetching, per replica.
pub const DEFAULT_HSDIR_SPREAD_FETCH: usize = 3;

/// Default cap on client streams attached to one rendezvous circuit.
pub const DEFAULT_MAX_STREAMS_PER_RDV_CIRCUIT: u64 = 0; // 0 = unlimited

/// Configuration values the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsConfig {
    voting_interval_secs: u64,
    voting_start_offset_secs: u64,
    time_period_length_mins: u64,
    num_intro_points: u8,
    is_single_onion: bool,
    max_streams_per_rdv_circuit: u64,
    hidden_service_dir: PathBuf,
    hsdir_n_replicas: u64,
    hsdir_spread_store: usize,
    hsdir_spread_fetch: usize,
    strict_nodes: bool,
}

impl Default for HsConfig {
    fn default() -> Self {
        Self {
            voting_interval_secs: DEFAULT_VOTING_INTERVAL_SECS,
            voting_start_offset_secs: 0,
            time_period_length_mins: crate::hs::time_period::TIME_PERIOD_LENGTH_DEFAULT,
            num_intro_points: DEFAULT_NUM_INTRO_POINTS,
            is_single_onion: false,
            max_streams_per_rdv_circuit: DEFAULT_MAX_STREAMS_PER_RDV_CIRCUIT,
            hidden_service_dir: PathBuf::new(),
            hsdir_n_replicas: DEFAULT_HSDIR_N_REPLICAS,
            hsdir_spread_store: DEFAULT_HSDIR_SPREAD_STORE,
            hsdir_spread_fetch: DEFAULT_HSDIR_SPREAD_FETCH,
            strict_nodes: false,
        }
    }
}

impl HsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consensus voting interval, in seconds. Must be non-zero.
    pub fn set_voting_interval_secs(&mut self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(HsError::Internal("voting interval must be non-zero".into()));
        }
        self.voting_interval_secs = secs;
        Ok(())
    }

    pub fn voting_interval_secs(&self) -> u64 {
        self.voting_interval_secs
    }

    /// `TestingV3AuthVotingStartOffset` equivalent.
    pub fn set_voting_start_offset_secs(&mut self, secs: u64) {
        self.voting_start_offset_secs = secs;
    }

    pub fn voting_start_offset_secs(&self) -> u64 {
        self.voting_start_offset_secs
    }

    /// Time period length in minutes, clamped to the protocol bounds.
    pub fn set_time_period_length_mins(&mut self, mins: u64) -> Result<()> {
        if !(TIME_PERIOD_LENGTH_MIN..=TIME_PERIOD_LENGTH_MAX).contains(&mins) {
            return Err(HsError::Internal(format!(
                "time period length {} out of range [{}, {}]",
                mins, TIME_PERIOD_LENGTH_MIN, TIME_PERIOD_LENGTH_MAX
            )));
        }
        self.time_period_length_mins = mins;
        Ok(())
    }

    pub fn time_period_length_mins(&self) -> u64 {
        self.time_period_length_mins
    }

    pub fn set_num_intro_points(&mut self, n: u8) -> Result<()> {
        if n == 0 || n > MAX_NUM_INTRO_POINTS {
            return Err(HsError::Internal(format!(
                "num_intro_points {} out of range [1, {}]",
                n, MAX_NUM_INTRO_POINTS
            )));
        }
        self.num_intro_points = n;
        Ok(())
    }

    pub fn num_intro_points(&self) -> u8 {
        self.num_intro_points
    }

    /// Single-onion services build one-hop circuits to their intro points.
    pub fn set_single_onion(&mut self, single: bool) {
        self.is_single_onion = single;
    }

    pub fn is_single_onion(&self) -> bool {
        self.is_single_onion
    }

    /// Cap on streams attached to a rendezvous circuit; 0 means unlimited.
    pub fn set_max_streams_per_rdv_circuit(&mut self, max: u64) {
        self.max_streams_per_rdv_circuit = max;
    }

    pub fn max_streams_per_rdv_circuit(&self) -> u64 {
        self.max_streams_per_rdv_circuit
    }

    /// `HiddenServiceDir` equivalent; also the home of the `sr-state` file
    /// on a directory authority.
    pub fn set_hidden_service_dir(&mut self, dir: PathBuf) {
        self.hidden_service_dir = dir;
    }

    pub fn hidden_service_dir(&self) -> &PathBuf {
        &self.hidden_service_dir
    }

    pub fn set_hsdir_n_replicas(&mut self, n: u64) -> Result<()> {
        if n == 0 {
            return Err(HsError::Internal("hsdir replicas must be non-zero".into()));
        }
        self.hsdir_n_replicas = n;
        Ok(())
    }

    pub fn hsdir_n_replicas(&self) -> u64 {
        self.hsdir_n_replicas
    }

    pub fn set_hsdir_spread_store(&mut self, n: usize) {
        self.hsdir_spread_store = n;
    }

    pub fn hsdir_spread_store(&self) -> usize {
        self.hsdir_spread_store
    }

    pub fn set_hsdir_spread_fetch(&mut self, n: usize) {
        self.hsdir_spread_fetch = n;
    }

    pub fn hsdir_spread_fetch(&self) -> usize {
        self.hsdir_spread_fetch
    }

    /// `StrictNodes`: when set, an excluded intro point is never used even
    /// as a last resort.
    pub fn set_strict_nodes(&mut self, strict: bool) {
        self.strict_nodes = strict;
    }

    pub fn strict_nodes(&self) -> bool {
        self.strict_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HsConfig::default();
        assert_eq!(cfg.voting_interval_secs(), 3600);
        assert_eq!(cfg.num_intro_points(), 3);
        assert_eq!(cfg.time_period_length_mins(), 1440);
        assert!(!cfg.is_single_onion());
    }

    #[test]
    fn test_range_validation() {
        let mut cfg = HsConfig::default();
        assert!(cfg.set_voting_interval_secs(0).is_err());
        assert!(cfg.set_time_period_length_mins(10).is_err());
        assert!(cfg.set_time_period_length_mins(30).is_ok());
        assert!(cfg.set_num_intro_points(0).is_err());
        assert!(cfg.set_num_intro_points(11).is_err());
        assert!(cfg.set_num_intro_points(10).is_ok());
    }
}
