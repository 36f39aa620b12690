//! Introduction points: service-side records and relay-side verification
//!
//! The service keeps one `ServiceIntroPoint` per intro point it maintains:
//! the per-IP keypairs, usage counters, expiry and the INTRODUCE2 replay
//! cache. The relay role verifies incoming ESTABLISH_INTRO cells and keeps
//! the auth-key-to-circuit registry; its verification rules define the
//! contract the service and client must meet.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{hmac_sha3_256, sha3_256};
use crate::error::{HsError, Result};
use crate::hs::ident::{CircuitHandle, CircuitPurpose};
use crate::hs::{CircuitController, CloseReason};
use crate::protocol::{
    AuthKeyType, EstablishIntro, IntroEstablished, LinkSpecifier, RelayCommand,
};

/// Prefix the ESTABLISH_INTRO signature is computed over.
pub const ESTABLISH_INTRO_SIG_PREFIX: &[u8] = b"Tor establish-intro cell v1";

/// Fewest INTRODUCE2 cells an intro point serves before rotating out.
const INTRO_POINT_MIN_LIFETIME_INTRODUCTIONS: u64 = 16384;
/// Most INTRODUCE2 cells an intro point serves before rotating out.
const INTRO_POINT_MAX_LIFETIME_INTRODUCTIONS: u64 = 32768;

/// Shortest wall-clock lifetime of an intro point.
const INTRO_POINT_LIFETIME_MIN_SECS: u64 = 18 * 3600;
/// Longest wall-clock lifetime of an intro point.
const INTRO_POINT_LIFETIME_MAX_SECS: u64 = 24 * 3600;

/// Service-side record of one introduction point.
pub struct ServiceIntroPoint {
    /// How the intro point relay is reached.
    pub link_specifiers: Vec<LinkSpecifier>,
    /// Per-IP ed25519 authentication keypair.
    auth_keypair: SigningKey,
    /// Per-IP X25519 encryption secret.
    enc_secret: StaticSecret,
    enc_public: [u8; 32],
    /// RSA-1024 key for a legacy intro point; `None` for v3.
    pub legacy_rsa: Option<Vec<u8>>,
    /// INTRODUCE2 cells seen on this intro point.
    pub introduce2_count: u64,
    /// Rotation threshold, randomized per intro point.
    pub introduce2_max: u64,
    /// Unix time after which the intro point is rotated out.
    pub time_to_expire: u64,
    /// Circuit launch attempts for this intro point.
    pub circuit_retries: u32,
    /// Whether the intro circuit completed the establishment handshake.
    pub circuit_established: bool,
    /// Digests of encrypted INTRODUCE2 sections already processed.
    replay_cache: HashSet<[u8; 32]>,
}

impl ServiceIntroPoint {
    /// Create a fresh intro point record for a chosen relay, with new
    /// keypairs and randomized rotation thresholds.
    pub fn new(link_specifiers: Vec<LinkSpecifier>, now: u64) -> Self {
        let mut rng = rand::thread_rng();
        let auth_keypair = SigningKey::generate(&mut OsRng);
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let enc_public = *PublicKey::from(&enc_secret).as_bytes();
        Self {
            link_specifiers,
            auth_keypair,
            enc_secret,
            enc_public,
            legacy_rsa: None,
            introduce2_count: 0,
            introduce2_max: rng.gen_range(
                INTRO_POINT_MIN_LIFETIME_INTRODUCTIONS..=INTRO_POINT_MAX_LIFETIME_INTRODUCTIONS,
            ),
            time_to_expire: now
                + rng.gen_range(INTRO_POINT_LIFETIME_MIN_SECS..=INTRO_POINT_LIFETIME_MAX_SECS),
            circuit_retries: 0,
            circuit_established: false,
            replay_cache: HashSet::new(),
        }
    }

    /// The intro point's ed25519 authentication public key.
    pub fn auth_key(&self) -> [u8; 32] {
        self.auth_keypair.verifying_key().to_bytes()
    }

    /// The intro point's X25519 encryption public key.
    pub fn enc_key(&self) -> [u8; 32] {
        self.enc_public
    }

    pub(crate) fn enc_secret(&self) -> &StaticSecret {
        &self.enc_secret
    }

    /// An intro point expires when either limit is reached.
    pub fn is_expired(&self, now: u64) -> bool {
        self.introduce2_count >= self.introduce2_max || now >= self.time_to_expire
    }

    /// Record the encrypted section of an INTRODUCE2; true when it was
    /// already seen (a replay, to be dropped).
    pub fn check_and_record_replay(&mut self, encrypted: &[u8]) -> bool {
        let digest = sha3_256(&[encrypted]);
        !self.replay_cache.insert(digest)
    }

    /// Build and sign the ESTABLISH_INTRO cell for this intro point.
    ///
    /// The MAC keys on the circuit key material shared with the chosen
    /// relay; the signature covers the MAC'd prefix, the MAC itself and
    /// the signature length, all under the cell's fixed prefix string.
    pub fn build_establish_intro(&self, circuit_key_material: &[u8]) -> Result<Vec<u8>> {
        let auth_key = self.auth_key();

        let mut buf = Vec::with_capacity(1 + 2 + 32 + 1 + 32 + 2 + 64);
        buf.push(AuthKeyType::Ed25519 as u8);
        buf.extend_from_slice(&(auth_key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&auth_key);
        buf.push(0); // no extensions

        let mac = hmac_sha3_256(circuit_key_material, &[&buf]);
        buf.extend_from_slice(&mac);
        buf.extend_from_slice(&(ed25519_dalek::SIGNATURE_LENGTH as u16).to_be_bytes());

        let mut sig_input = Vec::with_capacity(ESTABLISH_INTRO_SIG_PREFIX.len() + buf.len());
        sig_input.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
        sig_input.extend_from_slice(&buf);
        let sig = self.auth_keypair.sign(&sig_input);

        buf.extend_from_slice(&sig.to_bytes());
        Ok(buf)
    }
}

/// Verify a parsed ESTABLISH_INTRO cell against its raw bytes and the
/// circuit key material. Returns the authenticated auth key.
pub fn verify_establish_intro(
    cell: &EstablishIntro,
    raw: &[u8],
    circuit_key_material: &[u8],
) -> Result<[u8; 32]> {
    if cell.auth_key_type != AuthKeyType::Ed25519 {
        return Err(HsError::UnexpectedMessage(
            "legacy auth key on v3 verification path".into(),
        ));
    }
    let auth_key: [u8; 32] = cell
        .auth_key
        .as_slice()
        .try_into()
        .map_err(|_| HsError::InvalidCell("ed25519 auth key is not 32 bytes".into()))?;

    // Signature first, over the prefixed signature-covered span.
    let verifying_key =
        VerifyingKey::from_bytes(&auth_key).map_err(|_| HsError::BadSignature)?;
    let signature =
        Signature::from_slice(&cell.sig).map_err(|_| HsError::BadSignature)?;
    let mut sig_input =
        Vec::with_capacity(ESTABLISH_INTRO_SIG_PREFIX.len() + cell.sig_covered(raw)?.len());
    sig_input.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
    sig_input.extend_from_slice(cell.sig_covered(raw)?);
    if verifying_key.verify(&sig_input, &signature).is_err() {
        log::warn!("ESTABLISH_INTRO signature not as expected");
        return Err(HsError::BadSignature);
    }

    // Then the MAC over the exact byte range that was read.
    let expected_mac = hmac_sha3_256(circuit_key_material, &[cell.mac_covered(raw)?]);
    let ok: bool = expected_mac.ct_eq(&cell.handshake_mac).into();
    if !ok {
        log::warn!("ESTABLISH_INTRO handshake MAC not as expected");
        return Err(HsError::BadMac);
    }

    Ok(auth_key)
}

/// What the relay knows about the circuit an ESTABLISH_INTRO arrived on.
#[derive(Debug, Clone)]
pub struct RelayCircuitInfo {
    pub handle: CircuitHandle,
    /// The circuit is a plain OR circuit (no prior purpose).
    pub is_or_circuit: bool,
    /// The circuit has an onward channel (not an edge circuit).
    pub has_onward_channel: bool,
    /// Shared key material from the circuit handshake, keying the MAC.
    pub key_material: Vec<u8>,
}

/// Relay role: the registry of established intro circuits keyed by auth
/// key, plus the ESTABLISH_INTRO entry point.
#[derive(Default)]
pub struct IntroPointRelay {
    circuits: HashMap<[u8; 32], CircuitHandle>,
}

impl IntroPointRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered circuit for an auth key, if any.
    pub fn circuit_for(&self, auth_key: &[u8; 32]) -> Option<CircuitHandle> {
        self.circuits.get(auth_key).copied()
    }

    /// Forget a circuit (it closed underneath us).
    pub fn unregister_circuit(&mut self, handle: CircuitHandle) {
        self.circuits.retain(|_, circ| *circ != handle);
    }

    /// Handle an ESTABLISH_INTRO cell arriving on `circ`. On success the
    /// circuit becomes the intro circuit for the cell's auth key, an
    /// INTRO_ESTABLISHED is sent back, and any previous circuit with the
    /// same key is closed. Every failure closes the circuit with
    /// TORPROTOCOL.
    pub fn handle_establish_intro(
        &mut self,
        circ: &RelayCircuitInfo,
        body: &[u8],
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        match self.handle_establish_intro_inner(circ, body, ctrl) {
            Ok(()) => Ok(()),
            Err(err) => {
                ctrl.close_circuit(circ.handle, CloseReason::TorProtocol);
                Err(err)
            }
        }
    }

    fn handle_establish_intro_inner(
        &mut self,
        circ: &RelayCircuitInfo,
        body: &[u8],
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        if !circ.is_or_circuit {
            return Err(HsError::UnexpectedMessage(
                "ESTABLISH_INTRO on non-OR circuit".into(),
            ));
        }
        if circ.has_onward_channel {
            return Err(HsError::UnexpectedMessage(
                "ESTABLISH_INTRO on non-edge circuit".into(),
            ));
        }
        if body.is_empty() {
            return Err(HsError::Truncated { needed: 1 });
        }
        // The first byte routes legacy cells to the (unsupported) v2
        // handler before the v3 parser ever runs.
        match AuthKeyType::from_u8(body[0]) {
            Some(AuthKeyType::Ed25519) => {}
            Some(_) => {
                return Err(HsError::UnexpectedMessage(
                    "legacy ESTABLISH_INTRO not supported".into(),
                ))
            }
            None => {
                return Err(HsError::InvalidCell(format!("auth_key_type {}", body[0])));
            }
        }

        let cell = EstablishIntro::parse(body)?;
        let auth_key = verify_establish_intro(&cell, body, &circ.key_material)?;

        // Keep the newest: close any prior intro circuit for this key.
        if let Some(previous) = self.circuits.insert(auth_key, circ.handle) {
            if previous != circ.handle {
                log::info!("closing superseded intro circuit for the same auth key");
                ctrl.close_circuit(previous, CloseReason::Finished);
            }
        }

        let reply = IntroEstablished::default().encode()?;
        if let Err(err) =
            ctrl.send_relay_cell(circ.handle, RelayCommand::IntroEstablished, &reply)
        {
            self.circuits.remove(&auth_key);
            return Err(err);
        }
        ctrl.change_purpose(circ.handle, CircuitPurpose::RelayIntroPoint);
        log::info!("established intro point circuit");
        Ok(())
    }
}
