//! Error types for the shared-random and onion-service core
//!
//! Every failure is classified into one of four kinds, which drive the
//! caller's recovery policy:
//! - `Transient`: retry after a refetch or backoff
//! - `Permanent`: close the affected circuits, surface to the stream layer
//! - `Protocol`: peer misbehavior, close with TORPROTOCOL, never retry the
//!   same peer in the same round
//! - `Persistence`: discard on-disk state, continue with a fresh one

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HsError>;

/// Coarse error classification used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing descriptor, exhausted intro pool, spent retry budget.
    Transient,
    /// Circuits lost, handshake failure, internal inconsistency.
    Permanent,
    /// Malformed cells, bad signatures, out-of-phase protocol messages.
    Protocol,
    /// Broken, expired or unreadable on-disk state.
    Persistence,
}

/// Main error type for the core.
#[derive(Error, Debug, Clone)]
pub enum HsError {
    // ===== Cell codec =====
    #[error("truncated input: {needed} more byte(s) required")]
    Truncated { needed: usize },

    #[error("invalid cell: {0}")]
    InvalidCell(String),

    #[error("refusing to encode inconsistent cell: {0}")]
    InconsistentCell(String),

    // ===== Handshake verification =====
    #[error("signature verification failed")]
    BadSignature,

    #[error("handshake MAC verification failed")]
    BadMac,

    #[error("ntor AUTH verification failed")]
    NtorAuthFailed,

    // ===== Shared-random protocol =====
    #[error("malformed commit line: {0}")]
    CommitParse(String),

    #[error("conflicting commit from authority {fingerprint}")]
    ConflictingCommit { fingerprint: String },

    #[error("commit rejected: {0}")]
    CommitRejected(String),

    // ===== Onion address =====
    #[error("onion address has invalid length")]
    AddressLengthInvalid,

    #[error("onion address failed to decode")]
    AddressDecodeFailed,

    #[error("onion address checksum mismatch")]
    AddressChecksumInvalid,

    // ===== Client/service state machines =====
    #[error("descriptor missing for service, refetch triggered")]
    DescriptorMissing,

    #[error("no usable introduction points")]
    NoUsableIntroPoints,

    #[error("intro circuit retry budget exhausted, retry in {wait_secs}s")]
    RetryBudgetExhausted { wait_secs: u64 },

    #[error("circuit closed: {0}")]
    CircuitClosed(String),

    #[error("unexpected message for circuit purpose: {0}")]
    UnexpectedMessage(String),

    #[error("introduction point exhausted")]
    IntroPointExhausted,

    // ===== Persistence =====
    #[error("state file rejected: {0}")]
    StateInvalid(String),

    #[error("state I/O error: {0}")]
    StateIo(String),

    // ===== Crypto / internal =====
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HsError {
    /// Classify this error into one of the four kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HsError::Truncated { .. }
            | HsError::InvalidCell(_)
            | HsError::BadSignature
            | HsError::BadMac
            | HsError::CommitParse(_)
            | HsError::ConflictingCommit { .. }
            | HsError::CommitRejected(_)
            | HsError::AddressLengthInvalid
            | HsError::AddressDecodeFailed
            | HsError::AddressChecksumInvalid
            | HsError::UnexpectedMessage(_) => ErrorKind::Protocol,

            HsError::DescriptorMissing
            | HsError::NoUsableIntroPoints
            | HsError::RetryBudgetExhausted { .. } => ErrorKind::Transient,

            HsError::StateInvalid(_) | HsError::StateIo(_) => ErrorKind::Persistence,

            HsError::InconsistentCell(_)
            | HsError::NtorAuthFailed
            | HsError::CircuitClosed(_)
            | HsError::IntroPointExhausted
            | HsError::Crypto(_)
            | HsError::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    pub fn is_persistence(&self) -> bool {
        self.kind() == ErrorKind::Persistence
    }
}

impl From<std::io::Error> for HsError {
    fn from(err: std::io::Error) -> Self {
        HsError::StateIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(HsError::Truncated { needed: 4 }.is_protocol());
        assert!(HsError::BadSignature.is_protocol());
        assert!(HsError::DescriptorMissing.is_transient());
        assert!(HsError::RetryBudgetExhausted { wait_secs: 10 }.is_transient());
        assert!(HsError::StateInvalid("magic".into()).is_persistence());
        assert!(HsError::NtorAuthFailed.is_permanent());
        assert!(HsError::CircuitClosed("both lost".into()).is_permanent());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HsError = io.into();
        assert!(err.is_persistence());
    }
}
