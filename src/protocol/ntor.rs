//! hs-ntor handshake for introduction and rendezvous
//!
//! The variant of ntor used between an onion-service client and service,
//! keyed by the intro point's encryption key and the descriptor
//! subcredential. It produces:
//! - the encrypted section of INTRODUCE1/2 (`CLIENT_PK | ciphertext | MAC`),
//! - the rendezvous `NTOR_KEY_SEED` and the `SERVER_PK | AUTH` handshake
//!   info carried by RENDEZVOUS1/2,
//! - the end-to-end circuit keys expanded from the seed.
//!
//! AUTH verification uses constant-time comparison.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{hs_mac, shake256_kdf};
use crate::error::{HsError, Result};
use crate::protocol::cell::HANDSHAKE_INFO_LEN;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// Length of the rendezvous key seed.
pub const HS_NTOR_KEY_SEED_LEN: usize = 32;
/// Length of the AUTH tag inside the handshake info.
pub const HS_NTOR_AUTH_INPUT_MAC_LEN: usize = 32;

/// AES-256-CTR key length for the INTRODUCE encrypted section.
const S_KEY_LEN: usize = 32;
/// MAC key length for the INTRODUCE encrypted section.
const MAC_KEY_LEN: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

fn aes256_ctr_apply(key: &[u8; S_KEY_LEN], data: &mut [u8]) {
    let iv = [0u8; 16];
    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(data);
}

/// ENC_KEY and MAC_KEY protecting one INTRODUCE encrypted section.
#[derive(Zeroize, ZeroizeOnDrop)]
struct IntroKeys {
    enc_key: [u8; S_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

/// Derive the INTRODUCE section keys from the shared secret half.
///
/// `intro_secret_hs_input = EXP(B,x) | AUTH_KEY | X | B | PROTOID`
/// `hs_keys = KDF(intro_secret_hs_input | t_hsenc | info, S_KEY_LEN + MAC_KEY_LEN)`
/// `info = m_hsexpand | subcredential`
fn derive_intro_keys(
    exp_bx: &[u8; 32],
    auth_key: &[u8; 32],
    client_pk: &[u8; 32],
    intro_enc_key: &[u8; 32],
    subcredential: &[u8; 32],
) -> IntroKeys {
    let mut okm = Zeroizing::new([0u8; S_KEY_LEN + MAC_KEY_LEN]);
    shake256_kdf(
        &[
            exp_bx,
            auth_key,
            client_pk,
            intro_enc_key,
            PROTOID,
            T_HSENC,
            M_HSEXPAND,
            subcredential,
        ],
        &mut okm[..],
    );
    let mut keys = IntroKeys {
        enc_key: [0u8; S_KEY_LEN],
        mac_key: [0u8; MAC_KEY_LEN],
    };
    keys.enc_key.copy_from_slice(&okm[..S_KEY_LEN]);
    keys.mac_key.copy_from_slice(&okm[S_KEY_LEN..]);
    keys
}

/// Compute `NTOR_KEY_SEED` and the AUTH tag from the rendezvous secret.
///
/// `rend_secret_hs_input = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID`
/// (the service computes the same bytes from its side of each exchange)
fn derive_rend_seed_and_auth(
    exp_first: &[u8; 32],
    exp_second: &[u8; 32],
    auth_key: &[u8; 32],
    intro_enc_key: &[u8; 32],
    client_pk: &[u8; 32],
    server_pk: &[u8; 32],
) -> (Zeroizing<[u8; HS_NTOR_KEY_SEED_LEN]>, [u8; HS_NTOR_AUTH_INPUT_MAC_LEN]) {
    let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 6 + PROTOID.len()));
    secret_input.extend_from_slice(exp_first);
    secret_input.extend_from_slice(exp_second);
    secret_input.extend_from_slice(auth_key);
    secret_input.extend_from_slice(intro_enc_key);
    secret_input.extend_from_slice(client_pk);
    secret_input.extend_from_slice(server_pk);
    secret_input.extend_from_slice(PROTOID);

    let key_seed = Zeroizing::new(hs_mac(&secret_input, &[T_HSENC]));
    let verify = hs_mac(&secret_input, &[T_HSVERIFY]);

    let mut auth_input = Vec::with_capacity(verify.len() + 32 * 4 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(auth_key);
    auth_input.extend_from_slice(intro_enc_key);
    auth_input.extend_from_slice(server_pk);
    auth_input.extend_from_slice(client_pk);
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    let auth = hs_mac(&auth_input, &[T_HSMAC]);
    (key_seed, auth)
}

/// Client side of the hs-ntor handshake.
///
/// One instance lives for the duration of a single introduction attempt:
/// it seals the INTRODUCE1 payload and later completes the RENDEZVOUS2
/// handshake info into the key seed.
pub struct ClientIntroHandshake {
    client_secret: StaticSecret,
    client_public: PublicKey,
    /// Ed25519 auth key of the chosen intro point.
    intro_auth_key: [u8; 32],
    /// X25519 encryption key of the chosen intro point (`B`).
    intro_enc_key: [u8; 32],
    subcredential: [u8; 32],
}

impl ClientIntroHandshake {
    /// Create a handshake for the chosen intro point, generating the
    /// client's ephemeral keypair.
    pub fn new(intro_auth_key: [u8; 32], intro_enc_key: [u8; 32], subcredential: [u8; 32]) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            intro_auth_key,
            intro_enc_key,
            subcredential,
        }
    }

    /// The client's ephemeral public key (`X`).
    pub fn client_pk(&self) -> [u8; 32] {
        *self.client_public.as_bytes()
    }

    /// Encrypt and authenticate an INTRODUCE1 plaintext.
    ///
    /// `cell_prefix` must be the encoded INTRODUCE1 bytes that precede the
    /// encrypted section (the MAC covers prefix, `CLIENT_PK` and
    /// ciphertext). Returns `CLIENT_PK | ciphertext | MAC`.
    pub fn seal_payload(&self, plaintext: &[u8], cell_prefix: &[u8]) -> Vec<u8> {
        let b = PublicKey::from(self.intro_enc_key);
        let exp_bx = self.client_secret.diffie_hellman(&b);
        let keys = derive_intro_keys(
            exp_bx.as_bytes(),
            &self.intro_auth_key,
            self.client_public.as_bytes(),
            &self.intro_enc_key,
            &self.subcredential,
        );

        let mut ciphertext = plaintext.to_vec();
        aes256_ctr_apply(&keys.enc_key, &mut ciphertext);

        let mac = hs_mac(
            &keys.mac_key,
            &[cell_prefix, self.client_public.as_bytes(), &ciphertext],
        );

        let mut out = Vec::with_capacity(32 + ciphertext.len() + mac.len());
        out.extend_from_slice(self.client_public.as_bytes());
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&mac);
        out
    }

    /// Complete the handshake from the RENDEZVOUS2 handshake info,
    /// verifying the service's AUTH tag in constant time. Returns the
    /// rendezvous key seed.
    pub fn complete(
        &self,
        handshake_info: &[u8; HANDSHAKE_INFO_LEN],
    ) -> Result<Zeroizing<[u8; HS_NTOR_KEY_SEED_LEN]>> {
        let mut server_pk = [0u8; 32];
        server_pk.copy_from_slice(&handshake_info[..32]);
        let mut auth = [0u8; HS_NTOR_AUTH_INPUT_MAC_LEN];
        auth.copy_from_slice(&handshake_info[32..]);

        let y = PublicKey::from(server_pk);
        let b = PublicKey::from(self.intro_enc_key);
        let exp_yx = self.client_secret.diffie_hellman(&y);
        let exp_bx = self.client_secret.diffie_hellman(&b);

        let (key_seed, expected_auth) = derive_rend_seed_and_auth(
            exp_yx.as_bytes(),
            exp_bx.as_bytes(),
            &self.intro_auth_key,
            &self.intro_enc_key,
            self.client_public.as_bytes(),
            &server_pk,
        );

        let ok: bool = expected_auth.ct_eq(&auth).into();
        if !ok {
            log::warn!("hs-ntor AUTH mismatch on RENDEZVOUS2");
            return Err(HsError::NtorAuthFailed);
        }
        Ok(key_seed)
    }
}

/// Output of the service-side INTRODUCE2 handshake.
#[derive(Debug)]
pub struct ServiceIntroResult {
    /// Decrypted INTRODUCE payload, wiped on drop.
    pub plaintext: Zeroizing<Vec<u8>>,
    /// Rendezvous key seed for the e2e circuit.
    pub key_seed: Zeroizing<[u8; HS_NTOR_KEY_SEED_LEN]>,
    /// `SERVER_PK | AUTH` to send in RENDEZVOUS1.
    pub handshake_info: [u8; HANDSHAKE_INFO_LEN],
}

/// Service side: verify and decrypt an INTRODUCE2 encrypted section, then
/// produce the rendezvous side of the handshake.
///
/// `enc_secret` is the intro point's X25519 encryption private key (`b`),
/// `auth_key` its Ed25519 authentication key, `mac_prefix` the raw cell
/// bytes preceding the trailing MAC, and `encrypted` the full
/// `CLIENT_PK | ciphertext | MAC` section.
pub fn service_receive_introduce(
    enc_secret: &StaticSecret,
    auth_key: &[u8; 32],
    subcredential: &[u8; 32],
    mac_prefix: &[u8],
    encrypted: &[u8],
) -> Result<ServiceIntroResult> {
    if encrypted.len() < 32 + HS_NTOR_AUTH_INPUT_MAC_LEN {
        return Err(HsError::Truncated {
            needed: 32 + HS_NTOR_AUTH_INPUT_MAC_LEN - encrypted.len(),
        });
    }
    let mut client_pk_bytes = [0u8; 32];
    client_pk_bytes.copy_from_slice(&encrypted[..32]);
    let ciphertext = &encrypted[32..encrypted.len() - HS_NTOR_AUTH_INPUT_MAC_LEN];
    let mac = &encrypted[encrypted.len() - HS_NTOR_AUTH_INPUT_MAC_LEN..];

    let client_pk = PublicKey::from(client_pk_bytes);
    let intro_enc_key = *PublicKey::from(enc_secret).as_bytes();
    let exp_xb = enc_secret.diffie_hellman(&client_pk);

    let keys = derive_intro_keys(
        exp_xb.as_bytes(),
        auth_key,
        &client_pk_bytes,
        &intro_enc_key,
        subcredential,
    );

    let expected_mac = hs_mac(&keys.mac_key, &[mac_prefix, &client_pk_bytes, ciphertext]);
    let ok: bool = expected_mac.ct_eq(mac).into();
    if !ok {
        log::warn!("hs-ntor MAC mismatch on INTRODUCE2");
        return Err(HsError::BadMac);
    }

    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    aes256_ctr_apply(&keys.enc_key, &mut plaintext);

    // Rendezvous half: fresh ephemeral keypair for the reply.
    let server_secret = StaticSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&server_secret);
    let exp_xy = server_secret.diffie_hellman(&client_pk);
    let exp_xb2 = enc_secret.diffie_hellman(&client_pk);

    let (key_seed, auth) = derive_rend_seed_and_auth(
        exp_xy.as_bytes(),
        exp_xb2.as_bytes(),
        auth_key,
        &intro_enc_key,
        &client_pk_bytes,
        server_public.as_bytes(),
    );

    let mut handshake_info = [0u8; HANDSHAKE_INFO_LEN];
    handshake_info[..32].copy_from_slice(server_public.as_bytes());
    handshake_info[32..].copy_from_slice(&auth);

    Ok(ServiceIntroResult {
        plaintext,
        key_seed,
        handshake_info,
    })
}

/// End-to-end keys for a joined rendezvous circuit, expanded from the
/// ntor key seed.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct RendCircuitKeys {
    /// Forward digest seed (service-bound direction)
    pub forward_digest: [u8; 32],
    /// Backward digest seed
    pub backward_digest: [u8; 32],
    /// Forward encryption key
    pub forward_key: [u8; 32],
    /// Backward encryption key
    pub backward_key: [u8; 32],
}

impl RendCircuitKeys {
    /// `K = KDF(NTOR_KEY_SEED | m_hsexpand, 128)` split into
    /// `Df | Db | Kf | Kb`.
    pub fn expand(key_seed: &[u8; HS_NTOR_KEY_SEED_LEN]) -> Self {
        let mut okm = Zeroizing::new([0u8; 128]);
        shake256_kdf(&[key_seed, M_HSEXPAND], &mut okm[..]);
        let mut keys = Self {
            forward_digest: [0u8; 32],
            backward_digest: [0u8; 32],
            forward_key: [0u8; 32],
            backward_key: [0u8; 32],
        };
        keys.forward_digest.copy_from_slice(&okm[0..32]);
        keys.backward_digest.copy_from_slice(&okm[32..64]);
        keys.forward_key.copy_from_slice(&okm[64..96]);
        keys.backward_key.copy_from_slice(&okm[96..128]);
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (StaticSecret, [u8; 32], [u8; 32], [u8; 32]) {
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let enc_public = *PublicKey::from(&enc_secret).as_bytes();
        let auth_key = [0x21u8; 32];
        let subcredential = [0x42u8; 32];
        (enc_secret, enc_public, auth_key, subcredential)
    }

    #[test]
    fn test_full_handshake_agreement() {
        let (enc_secret, enc_public, auth_key, subcred) = setup();

        let client = ClientIntroHandshake::new(auth_key, enc_public, subcred);
        let plaintext = b"introduce payload bytes".to_vec();
        let prefix = b"cell prefix";
        let encrypted = client.seal_payload(&plaintext, prefix);

        let result =
            service_receive_introduce(&enc_secret, &auth_key, &subcred, prefix, &encrypted)
                .unwrap();
        assert_eq!(&result.plaintext[..], &plaintext[..]);

        let client_seed = client.complete(&result.handshake_info).unwrap();
        assert_eq!(&client_seed[..], &result.key_seed[..]);

        // Both sides expand to the same circuit keys.
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&client_seed[..]);
        let ck = RendCircuitKeys::expand(&seed);
        let mut seed2 = [0u8; 32];
        seed2.copy_from_slice(&result.key_seed[..]);
        let sk = RendCircuitKeys::expand(&seed2);
        assert_eq!(ck.forward_key, sk.forward_key);
        assert_eq!(ck.backward_digest, sk.backward_digest);
    }

    #[test]
    fn test_mac_rejects_tampered_prefix() {
        let (enc_secret, enc_public, auth_key, subcred) = setup();
        let client = ClientIntroHandshake::new(auth_key, enc_public, subcred);
        let encrypted = client.seal_payload(b"payload", b"prefix");
        let err =
            service_receive_introduce(&enc_secret, &auth_key, &subcred, b"prefiy", &encrypted)
                .unwrap_err();
        assert!(matches!(err, HsError::BadMac));
    }

    #[test]
    fn test_mac_rejects_tampered_ciphertext() {
        let (enc_secret, enc_public, auth_key, subcred) = setup();
        let client = ClientIntroHandshake::new(auth_key, enc_public, subcred);
        let mut encrypted = client.seal_payload(b"payload", b"prefix");
        let mid = encrypted.len() / 2;
        encrypted[mid] ^= 0x01;
        assert!(
            service_receive_introduce(&enc_secret, &auth_key, &subcred, b"prefix", &encrypted)
                .is_err()
        );
    }

    #[test]
    fn test_auth_rejects_corrupted_handshake_info() {
        let (enc_secret, enc_public, auth_key, subcred) = setup();
        let client = ClientIntroHandshake::new(auth_key, enc_public, subcred);
        let encrypted = client.seal_payload(b"payload", b"prefix");
        let result =
            service_receive_introduce(&enc_secret, &auth_key, &subcred, b"prefix", &encrypted)
                .unwrap();

        let mut tampered = result.handshake_info;
        tampered[40] ^= 0xff;
        assert!(matches!(
            client.complete(&tampered).unwrap_err(),
            HsError::NtorAuthFailed
        ));
    }

    #[test]
    fn test_wrong_subcredential_fails() {
        let (enc_secret, enc_public, auth_key, subcred) = setup();
        let client = ClientIntroHandshake::new(auth_key, enc_public, subcred);
        let encrypted = client.seal_payload(b"payload", b"prefix");
        let wrong = [0x43u8; 32];
        assert!(
            service_receive_introduce(&enc_secret, &auth_key, &wrong, b"prefix", &encrypted)
                .is_err()
        );
    }
}
