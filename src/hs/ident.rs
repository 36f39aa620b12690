//! Per-circuit identifiers for the onion-service subsystem
//!
//! Every origin circuit the subsystem uses carries a purpose tag and an
//! identifier with the key material that purpose needs. The identifier is
//! owned by the circuit (through the circuit subsystem's table); related
//! bookkeeping clones it, never aliases it mutably.

use zeroize::Zeroizing;

use crate::protocol::{HANDSHAKE_INFO_LEN, REND_COOKIE_LEN};

/// Opaque handle the circuit subsystem hands out for a launched circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitHandle(pub u64);

/// Purpose of an onion-service circuit. Service-side purposes carry the
/// `S` prefix, client-side the `C` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitPurpose {
    /// Service: circuit launched toward a relay to establish an intro point.
    SEstablishIntro,
    /// Service: established intro-point circuit.
    SIntro,
    /// Service: connecting to the client's rendezvous point.
    SConnectRend,
    /// Service: joined rendezvous circuit.
    SRendJoined,
    /// Client: intro circuit building or ready to introduce.
    CIntroducing,
    /// Client: INTRODUCE1 sent, waiting for the ack.
    CIntroduceAckWait,
    /// Client: introduction acknowledged; circuit about to close.
    CIntroduceAcked,
    /// Client: rendezvous circuit building or awaiting the relay ack.
    CEstablishRend,
    /// Client: rendezvous point acknowledged the cookie.
    CRendReady,
    /// Client: rendezvous ready and the introduction was acked.
    CRendReadyIntroAcked,
    /// Client: joined rendezvous circuit.
    CRendJoined,
    /// Relay: a circuit serving as a registered introduction point.
    RelayIntroPoint,
}

impl CircuitPurpose {
    /// True for the purposes that identify an intro circuit.
    pub fn is_intro(&self) -> bool {
        matches!(
            self,
            CircuitPurpose::SEstablishIntro
                | CircuitPurpose::SIntro
                | CircuitPurpose::CIntroducing
                | CircuitPurpose::CIntroduceAckWait
                | CircuitPurpose::CIntroduceAcked
                | CircuitPurpose::RelayIntroPoint
        )
    }

    /// True for the purposes that identify a rendezvous circuit.
    pub fn is_rendezvous(&self) -> bool {
        !self.is_intro()
    }
}

/// Introduction-point authentication key, legacy or modern.
///
/// Every operation dispatches on this tag; legacy paths reject cells
/// carrying modern keys and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntroKey {
    /// RSA-1024 public key, DER encoded (v2 services).
    Legacy(Vec<u8>),
    /// Ed25519 public key (v3 services).
    Modern([u8; 32]),
}

/// Circuit identifier attached to each onion-service origin circuit.
///
/// Not every field is populated; which ones are depends on the purpose.
#[derive(Debug, Clone)]
pub struct CircuitIdentifier {
    /// (All circuits) service identity public key.
    pub identity_pk: [u8; 32],
    /// (Intro circuits) the intro point's authentication key.
    pub intro_key: Option<IntroKey>,
    /// (Client rendezvous circuits) the chosen intro point's X25519
    /// encryption key, copied in so RENDEZVOUS2 can finish the ntor.
    pub intro_enc_pk: Option<[u8; 32]>,
    /// (Rendezvous circuits) cookie registered at the rendezvous point.
    pub rendezvous_cookie: Option<[u8; REND_COOKIE_LEN]>,
    /// (Service rendezvous circuits) `SERVER_PK | AUTH` for RENDEZVOUS1.
    pub rendezvous_handshake_info: Option<[u8; HANDSHAKE_INFO_LEN]>,
    /// (Rendezvous circuits) ntor key seed for the e2e circuit keys.
    pub rendezvous_ntor_key_seed: Option<Zeroizing<[u8; 32]>>,
    /// (Rendezvous circuits) streams attached so far, checked against the
    /// configured per-circuit cap.
    pub num_rdv_streams: u64,
}

impl CircuitIdentifier {
    /// Identifier with only the service identity set.
    pub fn new(identity_pk: [u8; 32]) -> Self {
        Self {
            identity_pk,
            intro_key: None,
            intro_enc_pk: None,
            rendezvous_cookie: None,
            rendezvous_handshake_info: None,
            rendezvous_ntor_key_seed: None,
            num_rdv_streams: 0,
        }
    }

    /// Identifier for an intro circuit with a modern auth key.
    pub fn for_intro(identity_pk: [u8; 32], auth_key: [u8; 32]) -> Self {
        let mut ident = Self::new(identity_pk);
        ident.intro_key = Some(IntroKey::Modern(auth_key));
        ident
    }

    /// Identifier for a rendezvous circuit carrying a cookie.
    pub fn for_rendezvous(identity_pk: [u8; 32], cookie: [u8; REND_COOKIE_LEN]) -> Self {
        let mut ident = Self::new(identity_pk);
        ident.rendezvous_cookie = Some(cookie);
        ident
    }

    /// The modern auth key, if this identifier carries one.
    pub fn modern_auth_key(&self) -> Option<&[u8; 32]> {
        match &self.intro_key {
            Some(IntroKey::Modern(key)) => Some(key),
            _ => None,
        }
    }

    /// Count one more stream attached to this rendezvous circuit,
    /// enforcing the configured cap (0 means unlimited).
    pub fn attach_stream(&mut self, max_streams: u64) -> bool {
        if max_streams != 0 && self.num_rdv_streams >= max_streams {
            return false;
        }
        self.num_rdv_streams += 1;
        true
    }
}
