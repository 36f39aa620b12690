//! Wire formats for the onion-service and shared-random protocols
//!
//! Two families live here:
//! - Binary relay cells exchanged during introduction and rendezvous
//!   (`cell`), parsed into structs with byte-exact round-trip.
//! - Text lines carried in directory votes and the persisted shared-random
//!   state (`vote`).
//!
//! The hs-ntor handshake (`ntor`) sits on top of the cell codec: it
//! produces and consumes the encrypted section of INTRODUCE1/2 and the
//! handshake info of RENDEZVOUS1/2.

pub mod cell;
pub mod ntor;
pub mod vote;

pub use cell::{
    AuthKeyType, CellExtension, EstablishIntro, EstablishRendezvous, IntroAckStatus,
    IntroEstablished, Introduce1, Introduce1Payload, IntroduceAck, LinkSpecifier, Rendezvous1,
    Rendezvous2, RendezvousEstablished, HANDSHAKE_INFO_LEN, REND_COOKIE_LEN,
};
pub use ntor::{
    ClientIntroHandshake, RendCircuitKeys, ServiceIntroResult, HS_NTOR_AUTH_INPUT_MAC_LEN,
    HS_NTOR_KEY_SEED_LEN,
};
pub use vote::{
    commit_blob_decode, commit_blob_encode, reveal_blob_decode, reveal_blob_encode, CommitLine,
    SrvLine, COMMIT_BLOB_LEN, REVEAL_BLOB_LEN, SR_COMMIT_KEYWORD, SR_CURRENT_SRV_KEYWORD,
    SR_PREVIOUS_SRV_KEYWORD,
};

/// Relay cell commands used by the handshakes in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// ESTABLISH_INTRO - service asks a relay to become an intro point
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - client registers a cookie at a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client to intro point
    Introduce1 = 34,
    /// INTRODUCE2 - intro point to service
    Introduce2 = 35,
    /// RENDEZVOUS1 - service to rendezvous point
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - rendezvous point to client
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED - relay confirms the intro point
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED - relay confirms the rendezvous cookie
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - intro point acks/naks an INTRODUCE1
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}
