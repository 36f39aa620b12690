//! v3 onion-service subsystem
//!
//! Identity derivations (time periods, blinded keys, subcredentials,
//! onion addresses, HSDir indices) and the introduction/rendezvous state
//! machines for both the client and the service side.
//!
//! The circuit and stream subsystems are external: the state machines
//! talk to them through the `CircuitController` and `StreamLayer` traits,
//! and consult the consensus through `NodeDirectory`. Tests drive the
//! machines with mock implementations.

pub mod address;
pub mod client;
#[cfg(test)]
pub(crate) mod test_support;
pub mod hsdir;
pub mod ident;
pub mod intro_point;
pub mod keys;
pub mod service;
pub mod time_period;

pub use address::OnionAddress;
pub use client::{ClientDescriptor, DescriptorIntroPoint, HsClient};
pub use hsdir::HsDirEntry;
pub use ident::{CircuitHandle, CircuitIdentifier, CircuitPurpose, IntroKey};
pub use intro_point::{IntroPointRelay, ServiceIntroPoint};
pub use service::HsService;

use crate::error::Result;
use crate::protocol::{LinkSpecifier, RelayCommand};

/// Intro circuits time out after this long waiting for an INTRODUCE_ACK.
pub const MAX_REND_TIMEOUT_SECS: u64 = 30;

/// Consecutive rendezvous failures tolerated before the stream is failed.
pub const MAX_REND_FAILURES: u32 = 1;

/// Cap on service intro-circuit launches inside one retry period.
pub const MAX_INTRO_CIRCS_PER_PERIOD: u32 = 10;

/// Length of the service intro-circuit retry period.
pub const INTRO_CIRC_RETRY_PERIOD_SECS: u64 = 300;

/// Reasons a circuit is closed with; mirrored to the circuit subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean shutdown of a circuit that did its job.
    Finished,
    /// Peer violated the protocol.
    TorProtocol,
    /// Local failure.
    Internal,
    /// Gave up waiting.
    Timeout,
}

/// Reasons surfaced to the application stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailReason {
    /// No usable introduction points for the service.
    ResolveFailed,
    /// Peer misbehavior.
    TorProtocol,
    /// Unexpected local state.
    Internal,
}

/// The external circuit subsystem, as seen by the state machines.
///
/// Launching returns a handle immediately; completion arrives later as a
/// circuit-opened event. The core never holds more than the opaque handle.
pub trait CircuitController {
    /// Launch a circuit to the relay described by `target`, tagged with
    /// `purpose`. `one_hop` is set for single-onion services.
    fn launch_circuit(
        &mut self,
        purpose: CircuitPurpose,
        target: &[LinkSpecifier],
        one_hop: bool,
    ) -> Result<CircuitHandle>;

    /// Send a relay cell body on the circuit.
    fn send_relay_cell(
        &mut self,
        circuit: CircuitHandle,
        command: RelayCommand,
        body: &[u8],
    ) -> Result<()>;

    /// Change the tagged purpose of a circuit.
    fn change_purpose(&mut self, circuit: CircuitHandle, purpose: CircuitPurpose);

    /// Repurpose a built circuit to general use (the path is still good).
    fn repurpose_general(&mut self, circuit: CircuitHandle);

    /// Close the circuit with the given reason.
    fn close_circuit(&mut self, circuit: CircuitHandle, reason: CloseReason);

    /// Record activity for circuit-expiry bookkeeping (timestamp_dirty).
    fn mark_dirty(&mut self, circuit: CircuitHandle, now: u64);
}

/// Consensus queries the core needs; the directory subsystem is external.
pub trait NodeDirectory {
    /// Whether the node is listed in the current consensus.
    fn contains(&self, node_id: &[u8; 32]) -> bool;

    /// Whether the node is in the configured ExcludeNodes set.
    fn is_excluded(&self, node_id: &[u8; 32]) -> bool;

    /// The HSDir hash ring for the given SRV and time period: every HSDir
    /// node with its ring index.
    fn hsdir_ring(
        &self,
        srv: &[u8; 32],
        period_num: u64,
        period_length_secs: u64,
    ) -> Vec<HsDirEntry>;
}

/// The application (SOCKS) stream layer the handshakes report to.
pub trait StreamLayer {
    /// Move the streams targeting this service back to waiting for a
    /// descriptor (a refetch is in flight).
    fn flag_streams_await_descriptor(&mut self, service_pk: &[u8; 32]);

    /// A descriptor landed: streams parked on it go back to waiting for
    /// a circuit.
    fn resume_waiting_streams(&mut self, service_pk: &[u8; 32]);

    /// Attach streams waiting on this service to the joined circuit.
    fn attach_waiting_streams(&mut self, service_pk: &[u8; 32], circuit: CircuitHandle);

    /// Fail the streams targeting this service.
    fn fail_streams(&mut self, service_pk: &[u8; 32], reason: StreamFailReason);
}
