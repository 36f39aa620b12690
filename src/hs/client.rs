//! Client-side introduction and rendezvous state machine
//!
//! For each onion service the client pursues, two circuits run in
//! parallel: an intro circuit to one of the service's intro points and a
//! rendezvous circuit to a relay of the client's choosing. Once the
//! rendezvous point has acknowledged the cookie and the intro circuit is
//! open, INTRODUCE1 goes out; the service then meets us at the rendezvous
//! point and RENDEZVOUS2 completes the end-to-end handshake.
//!
//! Client purposes move
//! `C_INTRODUCING -> C_INTRODUCE_ACK_WAIT -> C_INTRODUCE_ACKED` on the
//! intro circuit and `C_ESTABLISH_REND -> C_REND_READY ->
//! C_REND_READY_INTRO_ACKED -> C_REND_JOINED` on the rendezvous circuit.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::config::HsConfig;
use crate::crypto::rand_bytes;
use crate::error::{HsError, Result};
use crate::hs::ident::{CircuitHandle, CircuitPurpose};
use crate::hs::{
    CircuitController, CloseReason, NodeDirectory, StreamFailReason, StreamLayer,
    MAX_REND_FAILURES, MAX_REND_TIMEOUT_SECS,
};
use crate::protocol::ntor::{ClientIntroHandshake, RendCircuitKeys};
use crate::protocol::{
    EstablishRendezvous, IntroAckStatus, Introduce1, Introduce1Payload, IntroduceAck,
    LinkSpecifier, RelayCommand, Rendezvous2, RendezvousEstablished, REND_COOKIE_LEN,
};

/// One introduction point as decoded from a service descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorIntroPoint {
    /// Ed25519 authentication key of the intro point.
    pub auth_key: [u8; 32],
    /// X25519 encryption key of the intro point.
    pub enc_key: [u8; 32],
    /// How to reach the relay.
    pub link_specifiers: Vec<LinkSpecifier>,
    /// RSA key of a legacy (v2) intro point; unusable on the v3 path.
    pub legacy_key: Option<Vec<u8>>,
}

impl DescriptorIntroPoint {
    /// The relay's ed25519 identity, when a link specifier carries it.
    fn node_id(&self) -> Option<[u8; 32]> {
        self.link_specifiers.iter().find_map(|spec| match spec {
            LinkSpecifier::Ed25519Id(id) => Some(*id),
            _ => None,
        })
    }
}

/// A fetched and decrypted service descriptor, as the client consumes it.
#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub intro_points: Vec<DescriptorIntroPoint>,
    /// Subcredential for the period the descriptor was fetched under.
    pub subcredential: [u8; 32],
}

/// The rendezvous point the client picked for one connection attempt.
#[derive(Debug, Clone)]
pub struct RendezvousPoint {
    pub link_specifiers: Vec<LinkSpecifier>,
    /// The relay's ntor onion key, handed to the service so it can extend
    /// a circuit to the same relay.
    pub ntor_onion_key: [u8; 32],
}

/// State of one connection attempt to one service.
struct Attempt {
    service_pk: [u8; 32],
    intro_circ: Option<CircuitHandle>,
    rend_circ: Option<CircuitHandle>,
    chosen_intro: DescriptorIntroPoint,
    rendezvous_point: RendezvousPoint,
    cookie: [u8; REND_COOKIE_LEN],
    /// hs-ntor state; lives from INTRODUCE1 until RENDEZVOUS2.
    handshake: Option<ClientIntroHandshake>,
    intro_open: bool,
    rend_acked: bool,
    introduce_sent: bool,
    ack_wait_since: Option<u64>,
    failures: u32,
}

/// Client half of the v3 rendezvous protocol, multiplexing attempts to
/// any number of services.
pub struct HsClient {
    config: HsConfig,
    descriptors: HashMap<[u8; 32], ClientDescriptor>,
    attempts: HashMap<[u8; 32], Attempt>,
    /// Services whose descriptor we asked the fetcher to re-fetch.
    pending_refetch: Vec<[u8; 32]>,
}

impl HsClient {
    pub fn new(config: HsConfig) -> Self {
        Self {
            config,
            descriptors: HashMap::new(),
            attempts: HashMap::new(),
            pending_refetch: Vec::new(),
        }
    }

    /// Store a fetched descriptor in the client cache.
    pub fn store_descriptor(&mut self, service_pk: [u8; 32], descriptor: ClientDescriptor) {
        self.descriptors.insert(service_pk, descriptor);
    }

    /// A freshly fetched descriptor arrived. Streams parked on it resume
    /// the circuit-wait path when the descriptor is usable; otherwise
    /// they are failed with RESOLVEFAILED.
    pub fn descriptor_arrived(
        &mut self,
        service_pk: [u8; 32],
        descriptor: ClientDescriptor,
        dir: &dyn NodeDirectory,
        streams: &mut dyn StreamLayer,
    ) {
        let usable = Self::any_intro_points_usable(&descriptor, dir);
        self.descriptors.insert(service_pk, descriptor);
        if usable {
            log::info!("descriptor has arrived; resuming streams");
            streams.resume_waiting_streams(&service_pk);
        } else {
            log::info!("descriptor arrived without usable intro points; failing streams");
            streams.fail_streams(&service_pk, StreamFailReason::ResolveFailed);
        }
    }

    pub fn descriptor(&self, service_pk: &[u8; 32]) -> Option<&ClientDescriptor> {
        self.descriptors.get(service_pk)
    }

    /// Services a refetch was requested for; the fetch layer drains this.
    pub fn take_pending_refetches(&mut self) -> Vec<[u8; 32]> {
        std::mem::take(&mut self.pending_refetch)
    }

    /// An intro point is usable when it is a v3 intro point with at least
    /// one link specifier and its relay is in the consensus.
    fn intro_point_is_usable(ip: &DescriptorIntroPoint, dir: &dyn NodeDirectory) -> bool {
        if ip.legacy_key.is_some() {
            return false;
        }
        if ip.link_specifiers.is_empty() {
            return false;
        }
        match ip.node_id() {
            Some(node_id) => dir.contains(&node_id),
            None => false,
        }
    }

    /// Whether the descriptor has any usable intro point.
    pub fn any_intro_points_usable(
        descriptor: &ClientDescriptor,
        dir: &dyn NodeDirectory,
    ) -> bool {
        descriptor
            .intro_points
            .iter()
            .any(|ip| Self::intro_point_is_usable(ip, dir))
    }

    /// Pick an intro point uniformly at random from the usable ones.
    ///
    /// Excluded picks are kept as a fallback: if every usable intro point
    /// is excluded and StrictNodes is unset, the last excluded one is
    /// used anyway; with StrictNodes set the pick fails.
    fn pick_intro_point(
        &self,
        descriptor: &ClientDescriptor,
        dir: &dyn NodeDirectory,
    ) -> Result<DescriptorIntroPoint> {
        let mut usable: Vec<&DescriptorIntroPoint> = descriptor
            .intro_points
            .iter()
            .filter(|ip| Self::intro_point_is_usable(ip, dir))
            .collect();
        usable.shuffle(&mut rand::thread_rng());

        let mut excluded_fallback = None;
        for ip in usable {
            let excluded = ip
                .node_id()
                .map(|id| dir.is_excluded(&id))
                .unwrap_or(false);
            if excluded {
                excluded_fallback = Some(ip.clone());
                continue;
            }
            return Ok(ip.clone());
        }

        if self.config.strict_nodes() {
            log::warn!(
                "every introduction point is excluded and StrictNodes is set; \
                 cannot connect"
            );
            return Err(HsError::NoUsableIntroPoints);
        }
        excluded_fallback.ok_or(HsError::NoUsableIntroPoints)
    }

    /// Ask for a descriptor refetch and park the streams until it lands.
    fn trigger_refetch(&mut self, service_pk: [u8; 32], streams: &mut dyn StreamLayer) {
        log::info!("descriptor unusable or missing; triggering refetch");
        self.pending_refetch.push(service_pk);
        streams.flag_streams_await_descriptor(&service_pk);
    }

    /// Begin a connection attempt: pick an intro point, launch the intro
    /// circuit, and launch the rendezvous circuit with a fresh cookie.
    ///
    /// Missing or unusable descriptors yield a transient error after a
    /// refetch has been triggered.
    pub fn connect(
        &mut self,
        service_pk: [u8; 32],
        rendezvous_point: RendezvousPoint,
        ctrl: &mut dyn CircuitController,
        dir: &dyn NodeDirectory,
        streams: &mut dyn StreamLayer,
    ) -> Result<()> {
        let descriptor = match self.descriptors.get(&service_pk) {
            Some(desc) if Self::any_intro_points_usable(desc, dir) => desc.clone(),
            _ => {
                self.trigger_refetch(service_pk, streams);
                return Err(HsError::DescriptorMissing);
            }
        };

        let chosen_intro = self.pick_intro_point(&descriptor, dir)?;

        let intro_circ = ctrl.launch_circuit(
            CircuitPurpose::CIntroducing,
            &chosen_intro.link_specifiers,
            false,
        )?;
        let rend_circ = match ctrl.launch_circuit(
            CircuitPurpose::CEstablishRend,
            &rendezvous_point.link_specifiers,
            false,
        ) {
            Ok(circ) => circ,
            Err(err) => {
                ctrl.close_circuit(intro_circ, CloseReason::Internal);
                return Err(err);
            }
        };

        let cookie: [u8; REND_COOKIE_LEN] = rand_bytes();
        self.attempts.insert(
            service_pk,
            Attempt {
                service_pk,
                intro_circ: Some(intro_circ),
                rend_circ: Some(rend_circ),
                chosen_intro,
                rendezvous_point,
                cookie,
                handshake: None,
                intro_open: false,
                rend_acked: false,
                introduce_sent: false,
                ack_wait_since: None,
                failures: 0,
            },
        );
        log::info!("launched intro and rendezvous circuits");
        Ok(())
    }

    fn attempt_by_intro_circ(&mut self, circ: CircuitHandle) -> Option<&mut Attempt> {
        self.attempts
            .values_mut()
            .find(|a| a.intro_circ == Some(circ))
    }

    fn attempt_by_rend_circ(&mut self, circ: CircuitHandle) -> Option<&mut Attempt> {
        self.attempts
            .values_mut()
            .find(|a| a.rend_circ == Some(circ))
    }

    /// Rendezvous circuit opened: register the cookie with the relay.
    pub fn handle_rend_circuit_opened(
        &mut self,
        circ: CircuitHandle,
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        let attempt = self
            .attempt_by_rend_circ(circ)
            .ok_or_else(|| HsError::Internal("opened circuit has no attempt".into()))?;
        let cell = EstablishRendezvous {
            cookie: attempt.cookie,
        };
        ctrl.send_relay_cell(circ, RelayCommand::EstablishRendezvous, &cell.encode())
    }

    /// RENDEZVOUS_ESTABLISHED: only legal while in `C_ESTABLISH_REND`.
    pub fn handle_rendezvous_established(
        &mut self,
        circ: CircuitHandle,
        payload: &[u8],
        now: u64,
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) -> Result<()> {
        RendezvousEstablished::parse(payload)?;
        let Some(attempt) = self.attempt_by_rend_circ(circ) else {
            log::warn!("unexpected RENDEZVOUS_ESTABLISHED; closing circuit");
            ctrl.close_circuit(circ, CloseReason::TorProtocol);
            return Err(HsError::UnexpectedMessage(
                "RENDEZVOUS_ESTABLISHED on unknown circuit".into(),
            ));
        };
        if attempt.rend_acked {
            // The circuit already left C_ESTABLISH_REND.
            log::warn!("duplicate RENDEZVOUS_ESTABLISHED; closing circuit");
            attempt.rend_circ = None;
            ctrl.close_circuit(circ, CloseReason::TorProtocol);
            return Err(HsError::UnexpectedMessage(
                "RENDEZVOUS_ESTABLISHED outside C_ESTABLISH_REND".into(),
            ));
        }
        attempt.rend_acked = true;
        ctrl.change_purpose(circ, CircuitPurpose::CRendReady);
        ctrl.mark_dirty(circ, now);
        log::info!("rendezvous point acknowledged; circuit ready");
        self.maybe_send_introduce1(now, ctrl, streams)
    }

    /// Intro circuit opened; INTRODUCE1 goes out once the rendezvous side
    /// is also ready.
    pub fn handle_intro_circuit_opened(
        &mut self,
        circ: CircuitHandle,
        now: u64,
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) -> Result<()> {
        let attempt = self
            .attempt_by_intro_circ(circ)
            .ok_or_else(|| HsError::Internal("opened circuit has no attempt".into()))?;
        attempt.intro_open = true;
        self.maybe_send_introduce1(now, ctrl, streams)
    }

    /// Send INTRODUCE1 on every attempt whose two circuits are ready.
    ///
    /// Returns a transient error when the descriptor disappeared from the
    /// cache (a refetch is triggered), a permanent one when sending
    /// failed and both circuits were closed.
    fn maybe_send_introduce1(
        &mut self,
        now: u64,
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) -> Result<()> {
        let ready: Vec<[u8; 32]> = self
            .attempts
            .values()
            .filter(|a| a.intro_open && a.rend_acked && !a.introduce_sent)
            .map(|a| a.service_pk)
            .collect();

        for service_pk in ready {
            self.send_introduce1(service_pk, now, ctrl, streams)?;
        }
        Ok(())
    }

    fn send_introduce1(
        &mut self,
        service_pk: [u8; 32],
        now: u64,
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) -> Result<()> {
        let Some(descriptor) = self.descriptors.get(&service_pk).cloned() else {
            // The descriptor was dropped between connect and now.
            self.trigger_refetch(service_pk, streams);
            return Err(HsError::DescriptorMissing);
        };
        let attempt = self
            .attempts
            .get_mut(&service_pk)
            .ok_or_else(|| HsError::Internal("no attempt for service".into()))?;
        let (intro_circ, rend_circ) = match (attempt.intro_circ, attempt.rend_circ) {
            (Some(i), Some(r)) => (i, r),
            _ => return Err(HsError::Internal("attempt missing a circuit".into())),
        };

        let handshake = ClientIntroHandshake::new(
            attempt.chosen_intro.auth_key,
            attempt.chosen_intro.enc_key,
            descriptor.subcredential,
        );

        let payload = Introduce1Payload {
            rendezvous_cookie: attempt.cookie,
            extensions: Vec::new(),
            onion_key: attempt.rendezvous_point.ntor_onion_key,
            link_specifiers: attempt.rendezvous_point.link_specifiers.clone(),
        };
        let plaintext = payload.encode()?;

        let mut cell = Introduce1::new_v3(
            attempt.chosen_intro.auth_key.to_vec(),
            Vec::new(),
            Vec::new(),
        );
        let prefix = cell.encode()?;
        cell.encrypted = handshake.seal_payload(&plaintext, &prefix);
        let bytes = cell.encode()?;

        if let Err(err) = ctrl.send_relay_cell(intro_circ, RelayCommand::Introduce1, &bytes) {
            // Permanent: the send already closed the intro circuit; take
            // the rendezvous one down too and surface the loss.
            log::warn!("unable to send INTRODUCE1; closing both circuits");
            ctrl.close_circuit(intro_circ, CloseReason::Internal);
            ctrl.close_circuit(rend_circ, CloseReason::Internal);
            attempt.intro_circ = None;
            attempt.rend_circ = None;
            streams.fail_streams(&service_pk, StreamFailReason::Internal);
            self.attempts.remove(&service_pk);
            let _ = err;
            return Err(HsError::CircuitClosed(
                "intro and rendezvous circuits closed".into(),
            ));
        }

        // The rendezvous circuit identifier learns the chosen intro keys
        // so RENDEZVOUS2 can complete the ntor handshake.
        attempt.handshake = Some(handshake);
        attempt.introduce_sent = true;
        attempt.ack_wait_since = Some(now);
        ctrl.change_purpose(intro_circ, CircuitPurpose::CIntroduceAckWait);
        ctrl.mark_dirty(intro_circ, now);
        log::info!("INTRODUCE1 sent; waiting for ack");
        Ok(())
    }

    /// INTRODUCE_ACK on the intro circuit.
    ///
    /// Success moves the rendezvous circuit to `C_REND_READY_INTRO_ACKED`
    /// and closes the intro circuit, which has done its job. A NAK puts
    /// the intro circuit back to `C_INTRODUCING`. Unknown status codes
    /// are logged and ignored.
    pub fn handle_introduce_ack(
        &mut self,
        circ: CircuitHandle,
        payload: &[u8],
        now: u64,
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        let ack = IntroduceAck::parse(payload)?;
        let Some(attempt) = self.attempt_by_intro_circ(circ) else {
            log::warn!("unexpected INTRODUCE_ACK; closing circuit");
            ctrl.close_circuit(circ, CloseReason::TorProtocol);
            return Err(HsError::UnexpectedMessage(
                "INTRODUCE_ACK on unknown circuit".into(),
            ));
        };
        if !attempt.introduce_sent || attempt.ack_wait_since.is_none() {
            // The circuit is not in C_INTRODUCE_ACK_WAIT.
            attempt.intro_circ = None;
            ctrl.close_circuit(circ, CloseReason::TorProtocol);
            return Err(HsError::UnexpectedMessage(
                "INTRODUCE_ACK outside C_INTRODUCE_ACK_WAIT".into(),
            ));
        }

        match ack.status {
            IntroAckStatus::Success => {
                attempt.ack_wait_since = None;
                let rend_circ = attempt.rend_circ;
                attempt.intro_circ = None;
                if let Some(rend) = rend_circ {
                    ctrl.change_purpose(rend, CircuitPurpose::CRendReadyIntroAcked);
                    ctrl.mark_dirty(rend, now);
                }
                ctrl.change_purpose(circ, CircuitPurpose::CIntroduceAcked);
                ctrl.close_circuit(circ, CloseReason::Finished);
                log::info!("introduction acknowledged; awaiting RENDEZVOUS2");
            }
            IntroAckStatus::Failure | IntroAckStatus::BadFormat | IntroAckStatus::CantRelay => {
                log::info!(
                    "introduction NAK'd with status {}; will re-extend",
                    ack.status.as_u16()
                );
                attempt.introduce_sent = false;
                attempt.ack_wait_since = None;
                ctrl.change_purpose(circ, CircuitPurpose::CIntroducing);
            }
            IntroAckStatus::Unknown(code) => {
                log::info!("unknown INTRODUCE_ACK status {}; ignoring", code);
            }
        }
        Ok(())
    }

    /// RENDEZVOUS2 on the rendezvous circuit: complete the ntor
    /// handshake, join the circuit and attach the waiting streams.
    /// Returns the end-to-end circuit keys.
    pub fn handle_rendezvous2(
        &mut self,
        circ: CircuitHandle,
        payload: &[u8],
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) -> Result<RendCircuitKeys> {
        let cell = Rendezvous2::parse(payload)?;
        let attempt = match self.attempt_by_rend_circ(circ) {
            Some(a) => a,
            None => {
                ctrl.close_circuit(circ, CloseReason::TorProtocol);
                return Err(HsError::UnexpectedMessage(
                    "RENDEZVOUS2 on unknown circuit".into(),
                ));
            }
        };
        let service_pk = attempt.service_pk;
        let handshake = match attempt.handshake.as_ref() {
            Some(h) => h,
            None => {
                ctrl.close_circuit(circ, CloseReason::TorProtocol);
                return Err(HsError::UnexpectedMessage(
                    "RENDEZVOUS2 before INTRODUCE1".into(),
                ));
            }
        };

        let key_seed = match handshake.complete(&cell.handshake_info) {
            Ok(seed) => seed,
            Err(err) => {
                // Bad ntor: peer misbehavior, permanent for this attempt.
                ctrl.close_circuit(circ, CloseReason::TorProtocol);
                self.attempts.remove(&service_pk);
                return Err(err);
            }
        };

        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(&key_seed[..]);
        let keys = RendCircuitKeys::expand(&seed_bytes);

        ctrl.change_purpose(circ, CircuitPurpose::CRendJoined);
        streams.attach_waiting_streams(&service_pk, circ);
        self.attempts.remove(&service_pk);
        log::info!("rendezvous joined; streams attached");
        Ok(keys)
    }

    /// Periodic tick: time out intro circuits stuck waiting for an ack.
    /// After `MAX_REND_FAILURES` consecutive failures the attempt is
    /// abandoned and its streams failed.
    pub fn tick(
        &mut self,
        now: u64,
        ctrl: &mut dyn CircuitController,
        streams: &mut dyn StreamLayer,
    ) {
        let mut abandoned = Vec::new();
        for attempt in self.attempts.values_mut() {
            let timed_out = matches!(
                attempt.ack_wait_since,
                Some(since) if now >= since + MAX_REND_TIMEOUT_SECS
            );
            if !timed_out {
                continue;
            }
            log::info!("intro circuit timed out waiting for INTRODUCE_ACK");
            if let Some(intro) = attempt.intro_circ.take() {
                ctrl.close_circuit(intro, CloseReason::Timeout);
            }
            attempt.ack_wait_since = None;
            attempt.introduce_sent = false;
            attempt.failures += 1;
            if attempt.failures >= MAX_REND_FAILURES {
                if let Some(rend) = attempt.rend_circ.take() {
                    ctrl.close_circuit(rend, CloseReason::Timeout);
                }
                abandoned.push(attempt.service_pk);
            }
        }
        for service_pk in abandoned {
            streams.fail_streams(&service_pk, StreamFailReason::Internal);
            self.attempts.remove(&service_pk);
        }
    }

    /// A circuit died underneath an attempt. Losing both circuits is
    /// permanent: the streams are failed and the attempt dropped.
    pub fn handle_circuit_closed(
        &mut self,
        circ: CircuitHandle,
        streams: &mut dyn StreamLayer,
    ) {
        let mut dead = None;
        for attempt in self.attempts.values_mut() {
            if attempt.intro_circ == Some(circ) {
                attempt.intro_circ = None;
            }
            if attempt.rend_circ == Some(circ) {
                attempt.rend_circ = None;
            }
            // An acked intro circuit is closed on purpose; only count a
            // full loss when the rendezvous side is gone too.
            if attempt.rend_circ.is_none() && attempt.intro_circ.is_none() {
                dead = Some(attempt.service_pk);
            }
        }
        if let Some(service_pk) = dead {
            log::info!("both circuits lost; failing streams");
            streams.fail_streams(&service_pk, StreamFailReason::Internal);
            self.attempts.remove(&service_pk);
        }
    }
}
