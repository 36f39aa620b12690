//! Key derivations for the v3 onion-service identity
//!
//! Blinded keys rotate the service identity every time period:
//!
//! ```text
//! N = "key-blind" | INT_8(period_num) | INT_8(period_length)
//! h = SHA3-256(BLIND_STRING | A | B | N)    (clamped)
//! A' = h A
//! ```
//!
//! The private counterpart multiplies the expanded secret scalar by the
//! same factor and re-derives the signing prefix. Subcredentials bind the
//! identity and blinded keys into the descriptor-decryption KDF input.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::crypto::sha3_256;
use crate::error::{HsError, Result};

/// Prefix of the blinding parameter hash (NUL-terminated, as specified).
const BLIND_STRING: &[u8] = b"Derive temporary signing key\0";

/// Prefix of the blinded signing-prefix hash.
const BLIND_PREFIX_STRING: &[u8] = b"Derive temporary signing key hash input";

/// String form of the ed25519 basepoint mixed into the parameter hash.
const ED25519_BASEPOINT_STR: &[u8] =
    b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, \
46316835694926478169428394003475163141307993866256225615783033603165251855960)";

const KEYBLIND_NONCE_PREFIX: &[u8] = b"key-blind";

const CREDENTIAL_PREFIX: &[u8] = b"credential";
const SUBCREDENTIAL_PREFIX: &[u8] = b"subcredential";

/// The keyblinding nonce for a period:
/// `"key-blind" | INT_8(period_num) | INT_8(period_length)`.
pub fn keyblind_nonce(period_num: u64, period_length_secs: u64) -> [u8; 25] {
    let mut nonce = [0u8; 25];
    nonce[..9].copy_from_slice(KEYBLIND_NONCE_PREFIX);
    nonce[9..17].copy_from_slice(&period_num.to_be_bytes());
    nonce[17..25].copy_from_slice(&period_length_secs.to_be_bytes());
    nonce
}

/// Clamped blinding factor for the identity key and period nonce.
fn blinding_factor(pubkey: &[u8; 32], nonce: &[u8]) -> [u8; 32] {
    let mut param = sha3_256(&[BLIND_STRING, pubkey, ED25519_BASEPOINT_STR, nonce]);
    param[0] &= 248;
    param[31] &= 63;
    param[31] |= 64;
    param
}

/// Derive the blinded public key for a time period.
pub fn blind_public_key(
    pubkey: &[u8; 32],
    period_num: u64,
    period_length_secs: u64,
) -> Result<[u8; 32]> {
    let nonce = keyblind_nonce(period_num, period_length_secs);
    let param = blinding_factor(pubkey, &nonce);
    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or_else(|| HsError::Crypto("identity key is not a valid ed25519 point".into()))?;
    let factor = Scalar::from_bytes_mod_order(param);
    Ok((point * factor).compress().to_bytes())
}

/// A blinded keypair: the period-specific public key plus the secret
/// scalar and signing prefix that descriptor signing derives from.
pub struct BlindedKeypair {
    pub public: [u8; 32],
    /// Blinded secret scalar `a' = h a (mod l)`, wiped on drop.
    pub secret_scalar: Zeroizing<[u8; 32]>,
    /// Blinded signing prefix, wiped on drop.
    pub prefix: Zeroizing<[u8; 32]>,
}

/// Derive the blinded keypair from the master identity seed (the 32-byte
/// ed25519 secret key) for a time period.
pub fn blind_keypair(
    seed: &[u8; 32],
    pubkey: &[u8; 32],
    period_num: u64,
    period_length_secs: u64,
) -> Result<BlindedKeypair> {
    let nonce = keyblind_nonce(period_num, period_length_secs);
    let param = blinding_factor(pubkey, &nonce);

    // Expand the seed the way ed25519 signing does: scalar half clamped,
    // prefix half feeding the deterministic nonce.
    let expanded: Zeroizing<[u8; 64]> = Zeroizing::new(Sha512::digest(seed).into());
    let mut scalar_bytes = Zeroizing::new([0u8; 32]);
    scalar_bytes.copy_from_slice(&expanded[..32]);
    scalar_bytes[0] &= 248;
    scalar_bytes[31] &= 127;
    scalar_bytes[31] |= 64;

    let a = Scalar::from_bytes_mod_order(*scalar_bytes);
    let h = Scalar::from_bytes_mod_order(param);
    let blinded_scalar = a * h;

    let mut prefix_input = Zeroizing::new([0u8; 32]);
    prefix_input.copy_from_slice(&expanded[32..]);
    let blinded_prefix_full: Zeroizing<[u8; 64]> = Zeroizing::new(
        Sha512::digest([BLIND_PREFIX_STRING, &prefix_input[..]].concat()).into(),
    );
    let mut prefix = Zeroizing::new([0u8; 32]);
    prefix.copy_from_slice(&blinded_prefix_full[..32]);

    Ok(BlindedKeypair {
        public: blind_public_key(pubkey, period_num, period_length_secs)?,
        secret_scalar: Zeroizing::new(blinded_scalar.to_bytes()),
        prefix,
    })
}

/// `credential = SHA3-256("credential" | identity_pk)`
pub fn build_credential(identity_pk: &[u8; 32]) -> [u8; 32] {
    sha3_256(&[CREDENTIAL_PREFIX, identity_pk])
}

/// `subcredential = SHA3-256("subcredential" | credential | blinded_pk)`
pub fn build_subcredential(identity_pk: &[u8; 32], blinded_pk: &[u8; 32]) -> [u8; 32] {
    let credential = build_credential(identity_pk);
    sha3_256(&[SUBCREDENTIAL_PREFIX, &credential, blinded_pk])
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::edwards::EdwardsPoint;
    use ed25519_dalek::SigningKey;

    const PERIOD_LEN_SECS: u64 = 1440 * 60;

    fn test_identity() -> ([u8; 32], [u8; 32]) {
        let seed = [0x5eu8; 32];
        let signing = SigningKey::from_bytes(&seed);
        (seed, signing.verifying_key().to_bytes())
    }

    #[test]
    fn test_blinded_public_differs_per_period() {
        let (_, pubkey) = test_identity();
        let p1 = blind_public_key(&pubkey, 16903, PERIOD_LEN_SECS).unwrap();
        let p2 = blind_public_key(&pubkey, 16904, PERIOD_LEN_SECS).unwrap();
        assert_ne!(p1, p2);
        assert_ne!(p1, pubkey);
        // Deterministic for a fixed period.
        assert_eq!(
            p1,
            blind_public_key(&pubkey, 16903, PERIOD_LEN_SECS).unwrap()
        );
    }

    #[test]
    fn test_blinded_keypair_matches_blinded_public() {
        let (seed, pubkey) = test_identity();
        let kp = blind_keypair(&seed, &pubkey, 16903, PERIOD_LEN_SECS).unwrap();
        assert_eq!(
            kp.public,
            blind_public_key(&pubkey, 16903, PERIOD_LEN_SECS).unwrap()
        );
        // The blinded secret scalar generates the blinded public key.
        let scalar = Scalar::from_bytes_mod_order(*kp.secret_scalar);
        let derived = EdwardsPoint::mul_base(&scalar).compress().to_bytes();
        assert_eq!(derived, kp.public);
    }

    #[test]
    fn test_invalid_point_rejected() {
        // 32 x 0xff is not a valid compressed edwards point.
        let bad = [0xffu8; 32];
        assert!(blind_public_key(&bad, 1, PERIOD_LEN_SECS).is_err());
    }

    #[test]
    fn test_subcredential_binds_both_keys() {
        let (_, pubkey) = test_identity();
        let blinded1 = blind_public_key(&pubkey, 100, PERIOD_LEN_SECS).unwrap();
        let blinded2 = blind_public_key(&pubkey, 101, PERIOD_LEN_SECS).unwrap();
        let sub1 = build_subcredential(&pubkey, &blinded1);
        let sub2 = build_subcredential(&pubkey, &blinded2);
        assert_ne!(sub1, sub2);

        let other_identity = [9u8; 32];
        assert_ne!(sub1, build_subcredential(&other_identity, &blinded1));
    }

    #[test]
    fn test_keyblind_nonce_layout() {
        let nonce = keyblind_nonce(0x0102030405060708, 86_400);
        assert_eq!(&nonce[..9], b"key-blind");
        assert_eq!(&nonce[9..17], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&nonce[17..25], &86_400u64.to_be_bytes());
    }
}
