//! # tor-hs-core
//!
//! The shared-random (commit-and-reveal) coordinator run by directory
//! authorities, and the next-generation onion-service introduction and
//! rendezvous handshake that consumes the shared random values it
//! produces.
//!
//! ## Architecture
//!
//! ```text
//! voting scheduler (external)
//!   ↓ ticks
//! SrCoordinator ── SRV ──→ hs identity layer (blinded keys, indices)
//!                              ↓ keys
//! circuit events ──→ HsService / HsClient ──→ CircuitController (external)
//!                        ↕ cells
//!                  protocol codec (ESTABLISH_INTRO, INTRODUCE1/2, ...)
//! ```
//!
//! The transport, circuit multiplexer, vote transport, descriptor
//! encoding and configuration files are all external collaborators; this
//! crate exposes traits at those seams and typed errors everywhere. It
//! runs single-threaded and never blocks beyond the one bounded
//! state-file write.

// Modules
pub mod config;
pub mod crypto;
mod error;
pub mod hs;
pub mod protocol;
pub mod shared_random;

pub use config::HsConfig;
pub use error::{ErrorKind, HsError, Result};
pub use hs::{
    CircuitController, CircuitHandle, CircuitIdentifier, CircuitPurpose, CloseReason, HsClient,
    HsService, IntroKey, NodeDirectory, OnionAddress, StreamFailReason, StreamLayer,
};
pub use shared_random::{AuthorityIdentity, SrCoordinator, SrPhase, Srv};
