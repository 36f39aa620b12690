//! Cryptographic helpers shared across the core
//!
//! Thin wrappers over the digest and MAC primitives so call sites stay
//! short and the constructions used by the protocol live in one place:
//! - SHA3-256 over concatenated parts
//! - HMAC-SHA256 (shared-random value derivation)
//! - HMAC-SHA3-256 (ESTABLISH_INTRO handshake MAC)
//! - MAC(k, m) = SHA3-256(len(k) | k | m) (hs-ntor message authentication)
//! - SHAKE-256 key expansion
//!
//! Secret inputs are the caller's responsibility to zeroize; outputs that
//! are secret are returned in `Zeroizing` buffers where it matters.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};

use rand::rngs::OsRng;
use rand::RngCore;

type HmacSha256 = Hmac<Sha256>;
type HmacSha3_256 = Hmac<Sha3_256>;

/// Length of every digest and MAC output used by the protocol.
pub const DIGEST256_LEN: usize = 32;

/// SHA3-256 over the concatenation of `parts`.
pub fn sha3_256(parts: &[&[u8]]) -> [u8; DIGEST256_LEN] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// HMAC-SHA256 with the given key over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST256_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA3-256 with the given key over the concatenation of `parts`.
pub fn hmac_sha3_256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST256_LEN] {
    let mut mac = HmacSha3_256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// The hs-ntor message authentication construction:
/// `MAC(k, m) = SHA3-256(k_len as u64 BE | k | m)`.
pub fn hs_mac(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST256_LEN] {
    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, (key.len() as u64).to_be_bytes());
    Digest::update(&mut hasher, key);
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// SHAKE-256 expansion of the concatenation of `parts` into `out`.
pub fn shake256_kdf(parts: &[&[u8]], out: &mut [u8]) {
    let mut xof = Shake256::default();
    for part in parts {
        Update::update(&mut xof, part);
    }
    xof.finalize_xof().read(out);
}

/// Fill a fixed-size array with bytes from the OS RNG.
pub fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
