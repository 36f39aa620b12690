//! Shared-random commit-and-reveal protocol
//!
//! Directory authorities cooperatively produce one fresh 256-bit shared
//! random value (SRV) per protocol run. A run is 24 voting rounds: 12
//! commit rounds followed by 12 reveal rounds. Each authority commits to a
//! random number, later reveals it, and at the end of the reveal phase
//! every honest authority computes the same SRV from the set of valid
//! reveals.
//!
//! The engine here is driven by the external voting scheduler: it is
//! ticked once per voting round with the consensus `valid-after` time,
//! ingests commit lines from peer votes, emits the lines for our own
//! vote, and persists itself to the `sr-state` file after every mutation.

mod commit;
mod disk;
mod state;

pub use commit::Commit;
pub use disk::{DiskState, LoadedState, SR_STATE_FILENAME};
pub use state::{AuthorityIdentity, SrCoordinator, SrState};

use serde::{Deserialize, Serialize};

/// Number of voting rounds in each protocol phase.
pub const SHARED_RANDOM_N_ROUNDS: u64 = 12;

/// Number of phases in a protocol run (commit, reveal).
pub const SHARED_RANDOM_N_PHASES: u64 = 2;

/// Version of the shared-random protocol we speak.
pub const SR_PROTO_VERSION: u8 = 1;

/// Protocol floor: fewer valid reveals than this forces the disaster SRV.
pub const SR_SRV_MIN_REVEAL: usize = 3;

/// Invariant token mixed into the SRV HMAC message.
pub(crate) const SR_SRV_TOKEN: &[u8] = b"shared-random";

/// Invariant token keyed by the previous SRV in disaster mode.
pub(crate) const SR_DISASTER_TOKEN: &[u8] = b"shared-random-disaster";

/// Protocol phase of the shared-random state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrPhase {
    /// Authorities exchange commits; reveals are refused.
    Commit,
    /// Authorities attach reveals to the commits seen in commit phase.
    Reveal,
}

impl SrPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrPhase::Commit => "commit",
            SrPhase::Reveal => "reveal",
        }
    }
}

/// A shared random value: the number of reveals that fed it and the
/// 32-byte value itself. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srv {
    pub num_reveals: u64,
    pub value: [u8; 32],
}
