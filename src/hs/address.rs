//! v3 onion addresses
//!
//! An address encodes the service identity public key with a truncated
//! checksum and a version byte:
//!
//! ```text
//! CHECKSUM = SHA3-256(".onion checksum" | PUBKEY | VERSION)[:2]
//! ADDRESS  = base32(PUBKEY | CHECKSUM | VERSION)   // 35 bytes, 56 chars
//! ```
//!
//! Validation failures are distinguished so callers can report length,
//! decode and checksum problems separately.

use crate::crypto::sha3_256;
use crate::error::{HsError, Result};

/// Onion-service protocol version encoded in addresses.
pub const HS_VERSION: u8 = 3;

/// Prefix of the address checksum hash.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Bytes of the checksum kept in the address.
const CHECKSUM_LEN: usize = 2;

/// Binary address length: pubkey + checksum + version.
const ADDR_LEN: usize = 32 + CHECKSUM_LEN + 1;

/// Base32 length of the encoded address.
pub const ADDR_LEN_BASE32: usize = 56;

const BASE32: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

/// A validated v3 onion address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAddress {
    pub pubkey: [u8; 32],
    pub checksum: [u8; CHECKSUM_LEN],
    pub version: u8,
}

fn compute_checksum(pubkey: &[u8; 32], version: u8) -> [u8; CHECKSUM_LEN] {
    let digest = sha3_256(&[CHECKSUM_PREFIX, pubkey, &[version]]);
    [digest[0], digest[1]]
}

impl OnionAddress {
    /// Build the address for a service identity public key.
    pub fn build(pubkey: [u8; 32]) -> Self {
        Self {
            checksum: compute_checksum(&pubkey, HS_VERSION),
            pubkey,
            version: HS_VERSION,
        }
    }

    /// The 56-character base32 form (without the `.onion` suffix).
    pub fn encoded(&self) -> String {
        let mut bytes = [0u8; ADDR_LEN];
        bytes[..32].copy_from_slice(&self.pubkey);
        bytes[32..34].copy_from_slice(&self.checksum);
        bytes[34] = self.version;
        base32::encode(BASE32, &bytes).to_lowercase()
    }

    /// Parse and validate an address. A trailing `.onion` is accepted.
    pub fn parse(address: &str) -> Result<Self> {
        let body = address.strip_suffix(".onion").unwrap_or(address);
        if body.len() != ADDR_LEN_BASE32 {
            return Err(HsError::AddressLengthInvalid);
        }
        let decoded = base32::decode(BASE32, &body.to_uppercase())
            .ok_or(HsError::AddressDecodeFailed)?;
        if decoded.len() != ADDR_LEN {
            return Err(HsError::AddressDecodeFailed);
        }
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&decoded[..32]);
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&decoded[32..34]);
        let version = decoded[34];

        // The checksum covers the version byte, so both are checked here.
        if version != HS_VERSION || checksum != compute_checksum(&pubkey, version) {
            return Err(HsError::AddressChecksumInvalid);
        }
        Ok(Self {
            pubkey,
            checksum,
            version,
        })
    }

    /// Whether a string is a valid v3 onion address.
    pub fn is_valid(address: &str) -> bool {
        Self::parse(address).is_ok()
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.onion", self.encoded())
    }
}
