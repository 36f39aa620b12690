//! Service-side introduction and rendezvous state machine
//!
//! An `HsService` owns its master identity, the per-period descriptor
//! sets (two during the overlap window), and the intro points inside
//! them. It reacts to circuit events from the embedding event loop:
//! circuit-opened callbacks trigger ESTABLISH_INTRO or RENDEZVOUS1 sends,
//! cell arrivals drive the handshake forward.
//!
//! Purposes move `S_ESTABLISH_INTRO -> S_INTRO` on the intro side and
//! `S_CONNECT_REND -> S_REND_JOINED` on the rendezvous side.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::SigningKey;

use crate::config::HsConfig;
use crate::error::{HsError, Result};
use crate::hs::address::OnionAddress;
use crate::hs::ident::{CircuitHandle, CircuitIdentifier, CircuitPurpose};
use crate::hs::intro_point::ServiceIntroPoint;
use crate::hs::keys::{blind_keypair, build_subcredential, BlindedKeypair};
use crate::hs::time_period::{
    next_time_period_num, overlap_mode_is_active, period_length_secs, time_period_num,
};
use crate::hs::{
    CircuitController, CloseReason, INTRO_CIRC_RETRY_PERIOD_SECS, MAX_INTRO_CIRCS_PER_PERIOD,
};
use crate::protocol::ntor::service_receive_introduce;
use crate::protocol::{
    IntroEstablished, Introduce1, Introduce1Payload, LinkSpecifier, RelayCommand, Rendezvous1,
};

/// One descriptor's worth of service state for a single time period.
pub struct DescriptorSet {
    pub time_period: u64,
    pub blinded_pk: [u8; 32],
    /// Subcredential clients use against this descriptor.
    pub subcredential: [u8; 32],
    /// Blinded keypair for the period; the descriptor-encoding layer
    /// signs with it.
    blinded_keypair: BlindedKeypair,
    /// Intro points keyed by their auth key.
    intro_points: HashMap<[u8; 32], ServiceIntroPoint>,
}

impl DescriptorSet {
    pub fn blinded_keypair(&self) -> &BlindedKeypair {
        &self.blinded_keypair
    }

    pub fn intro_point(&self, auth_key: &[u8; 32]) -> Option<&ServiceIntroPoint> {
        self.intro_points.get(auth_key)
    }

    pub fn intro_point_count(&self) -> usize {
        self.intro_points.len()
    }

    /// Intro points whose establishment handshake completed.
    pub fn established_count(&self) -> usize {
        self.intro_points
            .values()
            .filter(|ip| ip.circuit_established)
            .count()
    }
}

/// The result of an intro circuit finishing its build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroCircuitOutcome {
    /// ESTABLISH_INTRO was sent; waiting for INTRO_ESTABLISHED.
    EstablishSent,
    /// The service already had enough intro circuits; this one was
    /// repurposed to general use and its intro point dropped.
    Repurposed,
}

/// A v3 onion service instance.
pub struct HsService {
    identity_seed: [u8; 32],
    identity_pk: [u8; 32],
    onion_address: OnionAddress,
    config: HsConfig,
    /// Descriptor for the current time period.
    current_desc: Option<DescriptorSet>,
    /// Descriptor for the next period, kept during overlap.
    next_desc: Option<DescriptorSet>,
    /// Which intro point each launched intro circuit serves.
    circ_to_auth: HashMap<CircuitHandle, [u8; 32]>,
    /// Intro circuits that reported the opened callback.
    opened_intro_circs: HashSet<CircuitHandle>,
    /// Identifiers of our rendezvous circuits.
    rend_idents: HashMap<CircuitHandle, CircuitIdentifier>,
    /// Launch budget bookkeeping.
    num_intro_circ_launched: u32,
    retry_period_started_at: u64,
}

impl HsService {
    /// Create a service from its master identity seed.
    pub fn new(identity_seed: [u8; 32], config: HsConfig) -> Self {
        let identity_pk = SigningKey::from_bytes(&identity_seed)
            .verifying_key()
            .to_bytes();
        let onion_address = OnionAddress::build(identity_pk);
        log::info!("service {} created", onion_address);
        Self {
            identity_seed,
            identity_pk,
            onion_address,
            config,
            current_desc: None,
            next_desc: None,
            circ_to_auth: HashMap::new(),
            opened_intro_circs: HashSet::new(),
            rend_idents: HashMap::new(),
            num_intro_circ_launched: 0,
            retry_period_started_at: 0,
        }
    }

    pub fn identity_pk(&self) -> &[u8; 32] {
        &self.identity_pk
    }

    pub fn onion_address(&self) -> &OnionAddress {
        &self.onion_address
    }

    pub fn current_descriptor(&self) -> Option<&DescriptorSet> {
        self.current_desc.as_ref()
    }

    pub fn next_descriptor(&self) -> Option<&DescriptorSet> {
        self.next_desc.as_ref()
    }

    fn build_descriptor_set(&self, time_period: u64) -> Result<DescriptorSet> {
        let period_len = period_length_secs(self.config.time_period_length_mins());
        let blinded_keypair =
            blind_keypair(&self.identity_seed, &self.identity_pk, time_period, period_len)?;
        let blinded_pk = blinded_keypair.public;
        Ok(DescriptorSet {
            time_period,
            blinded_pk,
            subcredential: build_subcredential(&self.identity_pk, &blinded_pk),
            blinded_keypair,
            intro_points: HashMap::new(),
        })
    }

    /// Maintain the descriptor sets for the consensus at `valid_after`:
    /// the current period always has one; during overlap the next period
    /// has one too. Rotation promotes the prepared next set.
    pub fn rotate_descriptors(&mut self, valid_after: u64) -> Result<()> {
        let period_len_mins = self.config.time_period_length_mins();
        let tpn = time_period_num(valid_after, period_len_mins);

        if self.current_desc.as_ref().map(|d| d.time_period) != Some(tpn) {
            // Promote the prepared next-period set when it matches.
            let promoted = match self.next_desc.take() {
                Some(next) if next.time_period == tpn => next,
                other => {
                    self.next_desc = other;
                    self.build_descriptor_set(tpn)?
                }
            };
            if let Some(old) = self.current_desc.replace(promoted) {
                log::info!(
                    "service {}: rotated out descriptor for period {}",
                    self.onion_address,
                    old.time_period
                );
                self.drop_descriptor_circuits(&old);
            }
        }

        if overlap_mode_is_active(valid_after, period_len_mins) {
            let next_tpn = next_time_period_num(valid_after, period_len_mins);
            if self.next_desc.as_ref().map(|d| d.time_period) != Some(next_tpn) {
                self.next_desc = Some(self.build_descriptor_set(next_tpn)?);
                log::info!(
                    "service {}: overlap active, keeping descriptor for period {}",
                    self.onion_address,
                    next_tpn
                );
            }
        } else {
            self.next_desc = None;
        }
        Ok(())
    }

    fn drop_descriptor_circuits(&mut self, set: &DescriptorSet) {
        let stale: Vec<CircuitHandle> = self
            .circ_to_auth
            .iter()
            .filter(|(_, auth)| set.intro_points.contains_key(*auth))
            .map(|(circ, _)| *circ)
            .collect();
        for circ in stale {
            self.circ_to_auth.remove(&circ);
            self.opened_intro_circs.remove(&circ);
        }
    }

    /// Add an intro point for the chosen relay to the current descriptor.
    /// Returns its auth key.
    pub fn add_intro_point(
        &mut self,
        link_specifiers: Vec<LinkSpecifier>,
        now: u64,
    ) -> Result<[u8; 32]> {
        let set = self
            .current_desc
            .as_mut()
            .ok_or_else(|| HsError::Internal("no current descriptor set".into()))?;
        let ip = ServiceIntroPoint::new(link_specifiers, now);
        let auth_key = ip.auth_key();
        set.intro_points.insert(auth_key, ip);
        Ok(auth_key)
    }

    /// Enforce the launch budget: at most `MAX_INTRO_CIRCS_PER_PERIOD`
    /// launches per retry period; afterwards callers wait out the rest of
    /// the window.
    fn check_intro_retry_budget(&mut self, now: u64) -> Result<()> {
        if now >= self.retry_period_started_at + INTRO_CIRC_RETRY_PERIOD_SECS {
            self.retry_period_started_at = now;
            self.num_intro_circ_launched = 0;
        }
        if self.num_intro_circ_launched >= MAX_INTRO_CIRCS_PER_PERIOD {
            let wait = self.retry_period_started_at + INTRO_CIRC_RETRY_PERIOD_SECS - now;
            return Err(HsError::RetryBudgetExhausted { wait_secs: wait });
        }
        Ok(())
    }

    /// Launch an intro circuit toward the intro point with `auth_key`.
    /// Single-onion services request a one-hop circuit.
    pub fn launch_intro_circuit(
        &mut self,
        auth_key: &[u8; 32],
        now: u64,
        ctrl: &mut dyn CircuitController,
    ) -> Result<CircuitHandle> {
        self.check_intro_retry_budget(now)?;
        let one_hop = self.config.is_single_onion();
        let set = self
            .current_desc
            .as_mut()
            .ok_or_else(|| HsError::Internal("no current descriptor set".into()))?;
        let ip = set
            .intro_points
            .get_mut(auth_key)
            .ok_or_else(|| HsError::Internal("unknown intro point".into()))?;

        // The launch counts against the budget even if it fails; the
        // circuit subsystem is what we are protecting.
        self.num_intro_circ_launched += 1;
        ip.circuit_retries += 1;

        let circ = ctrl.launch_circuit(
            CircuitPurpose::SEstablishIntro,
            &ip.link_specifiers,
            one_hop,
        )?;
        self.circ_to_auth.insert(circ, *auth_key);
        log::info!(
            "service {}: launched intro circuit (retry {})",
            self.onion_address,
            ip.circuit_retries
        );
        Ok(circ)
    }

    /// Count intro circuits that opened for the current descriptor.
    fn opened_intro_circuits(&self) -> usize {
        self.opened_intro_circs.len()
    }

    /// An intro circuit finished building. Either send ESTABLISH_INTRO on
    /// it, or repurpose it if the descriptor already has enough intro
    /// circuits (the built path is still useful as a general circuit).
    pub fn handle_intro_circuit_opened(
        &mut self,
        circ: CircuitHandle,
        circuit_key_material: &[u8],
        ctrl: &mut dyn CircuitController,
    ) -> Result<IntroCircuitOutcome> {
        let auth_key = *self
            .circ_to_auth
            .get(&circ)
            .ok_or_else(|| HsError::Internal("opened circuit has no intro point".into()))?;

        let num_needed = self.config.num_intro_points() as usize;
        if self.opened_intro_circuits() >= num_needed {
            log::info!(
                "service {}: intro circuit opened but we have enough; \
                 repurposing to general",
                self.onion_address
            );
            self.circ_to_auth.remove(&circ);
            if let Some(set) = self.current_desc.as_mut() {
                set.intro_points.remove(&auth_key);
            }
            ctrl.repurpose_general(circ);
            return Ok(IntroCircuitOutcome::Repurposed);
        }
        self.opened_intro_circs.insert(circ);

        let set = self
            .current_desc
            .as_mut()
            .ok_or_else(|| HsError::Internal("no current descriptor set".into()))?;
        let ip = set
            .intro_points
            .get_mut(&auth_key)
            .ok_or_else(|| HsError::Internal("unknown intro point".into()))?;

        let cell = ip.build_establish_intro(circuit_key_material)?;
        if let Err(err) = ctrl.send_relay_cell(circ, RelayCommand::EstablishIntro, &cell) {
            log::info!(
                "service {}: unable to send ESTABLISH_INTRO: {}",
                self.onion_address,
                err
            );
            ip.circuit_established = false;
            self.opened_intro_circs.remove(&circ);
            ctrl.close_circuit(circ, CloseReason::Internal);
            return Err(err);
        }
        Ok(IntroCircuitOutcome::EstablishSent)
    }

    /// INTRO_ESTABLISHED arrived: the intro point is live. The circuit
    /// purpose moves to `S_INTRO`.
    pub fn handle_intro_established(
        &mut self,
        circ: CircuitHandle,
        payload: &[u8],
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        let auth_key = *self
            .circ_to_auth
            .get(&circ)
            .ok_or_else(|| HsError::UnexpectedMessage("INTRO_ESTABLISHED on unknown circuit".into()))?;
        IntroEstablished::parse(payload)?;

        let set = self
            .current_desc
            .as_mut()
            .ok_or_else(|| HsError::Internal("no current descriptor set".into()))?;
        if let Some(ip) = set.intro_points.get_mut(&auth_key) {
            ip.circuit_established = true;
        }
        ctrl.change_purpose(circ, CircuitPurpose::SIntro);
        log::info!("service {}: intro point established", self.onion_address);
        Ok(())
    }

    /// An intro circuit died. The intro point is no longer established
    /// and will be retried within the launch budget.
    pub fn handle_intro_circuit_closed(&mut self, circ: CircuitHandle) {
        self.opened_intro_circs.remove(&circ);
        if let Some(auth_key) = self.circ_to_auth.remove(&circ) {
            if let Some(set) = self.current_desc.as_mut() {
                if let Some(ip) = set.intro_points.get_mut(&auth_key) {
                    ip.circuit_established = false;
                }
            }
        }
    }

    /// A valid INTRODUCE2 launches a rendezvous circuit to the client's
    /// chosen rendezvous point. Replays of the same encrypted section are
    /// dropped without counting.
    pub fn handle_introduce2(
        &mut self,
        circ: CircuitHandle,
        payload: &[u8],
        ctrl: &mut dyn CircuitController,
    ) -> Result<Option<CircuitHandle>> {
        let auth_key = *self
            .circ_to_auth
            .get(&circ)
            .ok_or_else(|| HsError::UnexpectedMessage("INTRODUCE2 on unknown circuit".into()))?;

        let cell = Introduce1::parse(payload)?;
        if cell.is_legacy() {
            return Err(HsError::UnexpectedMessage(
                "legacy INTRODUCE2 on a v3 intro point".into(),
            ));
        }
        if cell.auth_key.as_slice() != auth_key {
            return Err(HsError::UnexpectedMessage(
                "INTRODUCE2 auth key does not match the intro point".into(),
            ));
        }

        let subcredential;
        let result;
        {
            let set = self
                .current_desc
                .as_mut()
                .ok_or_else(|| HsError::Internal("no current descriptor set".into()))?;
            subcredential = set.subcredential;
            let ip = set
                .intro_points
                .get_mut(&auth_key)
                .ok_or_else(|| HsError::Internal("unknown intro point".into()))?;

            if ip.introduce2_count >= ip.introduce2_max {
                return Err(HsError::IntroPointExhausted);
            }
            if ip.check_and_record_replay(&cell.encrypted) {
                log::info!(
                    "service {}: replayed INTRODUCE2 dropped",
                    self.onion_address
                );
                return Ok(None);
            }

            // The intro MAC covers the cell bytes before the encrypted
            // section plus the client key and ciphertext inside it.
            let prefix_len = payload
                .len()
                .checked_sub(cell.encrypted.len())
                .ok_or_else(|| HsError::Internal("encrypted section longer than cell".into()))?;
            let mac_prefix = &payload[..prefix_len];
            result = service_receive_introduce(
                ip.enc_secret(),
                &auth_key,
                &subcredential,
                mac_prefix,
                &cell.encrypted,
            )?;

            // Full cell confirmed valid; count it now.
            ip.introduce2_count += 1;
        }

        let intro_payload = Introduce1Payload::parse(&result.plaintext)?;
        let rend_circ = ctrl.launch_circuit(
            CircuitPurpose::SConnectRend,
            &intro_payload.link_specifiers,
            false,
        )?;

        let mut ident = CircuitIdentifier::for_rendezvous(
            self.identity_pk,
            intro_payload.rendezvous_cookie,
        );
        ident.rendezvous_handshake_info = Some(result.handshake_info);
        ident.rendezvous_ntor_key_seed = Some(result.key_seed.clone());
        self.rend_idents.insert(rend_circ, ident);

        log::info!(
            "service {}: INTRODUCE2 accepted, rendezvous circuit launched",
            self.onion_address
        );
        Ok(Some(rend_circ))
    }

    /// Rendezvous circuit opened: send RENDEZVOUS1 and finalize to
    /// `S_REND_JOINED`.
    pub fn handle_rend_circuit_opened(
        &mut self,
        circ: CircuitHandle,
        ctrl: &mut dyn CircuitController,
    ) -> Result<()> {
        let ident = self
            .rend_idents
            .get(&circ)
            .ok_or_else(|| HsError::Internal("opened circuit has no rendezvous state".into()))?;
        let cookie = ident
            .rendezvous_cookie
            .ok_or_else(|| HsError::Internal("rendezvous circuit without cookie".into()))?;
        let handshake_info = ident
            .rendezvous_handshake_info
            .ok_or_else(|| HsError::Internal("rendezvous circuit without handshake info".into()))?;

        let cell = Rendezvous1 {
            cookie,
            handshake_info,
        };
        if let Err(err) = ctrl.send_relay_cell(circ, RelayCommand::Rendezvous1, &cell.encode()) {
            self.rend_idents.remove(&circ);
            ctrl.close_circuit(circ, CloseReason::Internal);
            return Err(err);
        }
        ctrl.change_purpose(circ, CircuitPurpose::SRendJoined);
        log::info!("service {}: rendezvous joined", self.onion_address);
        Ok(())
    }

    /// The rendezvous identifier for a circuit, for e2e key expansion.
    pub fn rend_identifier(&self, circ: CircuitHandle) -> Option<&CircuitIdentifier> {
        self.rend_idents.get(&circ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hs::test_support::MockController;
    use crate::protocol::ntor::ClientIntroHandshake;
    use crate::protocol::Introduce1;

    /// 2016-04-13 13:00:00 UTC, outside the overlap window.
    const NOW: u64 = 1_460_552_400;

    fn service() -> HsService {
        let mut svc = HsService::new([0x33; 32], HsConfig::default());
        svc.rotate_descriptors(NOW).unwrap();
        svc
    }

    fn establish_one(
        svc: &mut HsService,
        ctrl: &mut MockController,
    ) -> ([u8; 32], CircuitHandle) {
        let auth = svc
            .add_intro_point(vec![LinkSpecifier::Ed25519Id([8; 32])], NOW)
            .unwrap();
        let circ = svc.launch_intro_circuit(&auth, NOW, ctrl).unwrap();
        let outcome = svc
            .handle_intro_circuit_opened(circ, b"km", ctrl)
            .unwrap();
        assert_eq!(outcome, IntroCircuitOutcome::EstablishSent);
        svc.handle_intro_established(circ, &[0u8], ctrl).unwrap();
        (auth, circ)
    }

    fn valid_introduce2(svc: &HsService, auth_key: [u8; 32]) -> (Vec<u8>, ClientIntroHandshake) {
        let set = svc.current_descriptor().unwrap();
        let ip = set.intro_point(&auth_key).unwrap();
        let handshake = ClientIntroHandshake::new(auth_key, ip.enc_key(), set.subcredential);
        let payload = Introduce1Payload {
            rendezvous_cookie: [0x77; 20],
            extensions: Vec::new(),
            onion_key: [0x55; 32],
            link_specifiers: vec![LinkSpecifier::Ed25519Id([9; 32])],
        };
        let plaintext = payload.encode().unwrap();

        let mut cell = Introduce1::new_v3(auth_key.to_vec(), Vec::new(), Vec::new());
        let prefix = cell.encode().unwrap();
        cell.encrypted = handshake.seal_payload(&plaintext, &prefix);
        (cell.encode().unwrap(), handshake)
    }

    #[test]
    fn test_descriptor_sets_and_overlap() {
        let mut svc = HsService::new([0x33; 32], HsConfig::default());
        // 2016-04-13 01:00:00 UTC: overlap active.
        svc.rotate_descriptors(1_460_509_200).unwrap();
        let current = svc.current_descriptor().unwrap();
        let next = svc.next_descriptor().unwrap();
        assert_eq!(next.time_period, current.time_period + 1);
        assert_ne!(current.blinded_pk, next.blinded_pk);

        // 13:00 same day: overlap over, next set dropped, new period is
        // the one that was prepared.
        let prepared = next.time_period;
        svc.rotate_descriptors(NOW).unwrap();
        assert_eq!(svc.current_descriptor().unwrap().time_period, prepared);
        assert!(svc.next_descriptor().is_none());
    }

    #[test]
    fn test_full_establishment_flow() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let (auth, circ) = establish_one(&mut svc, &mut ctrl);

        assert_eq!(
            ctrl.purpose_of(circ),
            Some(CircuitPurpose::SIntro),
            "purpose moves S_ESTABLISH_INTRO -> S_INTRO"
        );
        let set = svc.current_descriptor().unwrap();
        assert!(set.intro_point(&auth).unwrap().circuit_established);
        // The sent cell verifies against the circuit key material.
        let sent = ctrl.sent_cells(circ);
        assert_eq!(sent.len(), 1);
        let cell = crate::protocol::EstablishIntro::parse(&sent[0].1).unwrap();
        crate::hs::intro_point::verify_establish_intro(&cell, &sent[0].1, b"km").unwrap();
    }

    #[test]
    fn test_intro_cap_repurposes_excess() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        // Default cap is 3 intro points.
        for _ in 0..3 {
            establish_one(&mut svc, &mut ctrl);
        }
        let extra_auth = svc
            .add_intro_point(vec![LinkSpecifier::Ed25519Id([8; 32])], NOW)
            .unwrap();
        let extra_circ = svc.launch_intro_circuit(&extra_auth, NOW, &mut ctrl).unwrap();
        let outcome = svc
            .handle_intro_circuit_opened(extra_circ, b"km", &mut ctrl)
            .unwrap();
        assert_eq!(outcome, IntroCircuitOutcome::Repurposed);
        assert_eq!(ctrl.repurposed, vec![extra_circ]);
        // The IP is dropped, not closed: the circuit itself stays up.
        assert!(ctrl.close_reason(extra_circ).is_none());
        assert_eq!(svc.current_descriptor().unwrap().intro_point_count(), 3);
    }

    #[test]
    fn test_send_failure_closes_and_unmarks() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let auth = svc
            .add_intro_point(vec![LinkSpecifier::Ed25519Id([8; 32])], NOW)
            .unwrap();
        let circ = svc.launch_intro_circuit(&auth, NOW, &mut ctrl).unwrap();
        ctrl.fail_send = true;
        assert!(svc.handle_intro_circuit_opened(circ, b"km", &mut ctrl).is_err());
        assert!(ctrl.close_reason(circ).is_some());
        assert!(
            !svc.current_descriptor()
                .unwrap()
                .intro_point(&auth)
                .unwrap()
                .circuit_established
        );
    }

    #[test]
    fn test_retry_budget() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let auth = svc
            .add_intro_point(vec![LinkSpecifier::Ed25519Id([8; 32])], NOW)
            .unwrap();
        for _ in 0..MAX_INTRO_CIRCS_PER_PERIOD {
            svc.launch_intro_circuit(&auth, NOW, &mut ctrl).unwrap();
        }
        let err = svc.launch_intro_circuit(&auth, NOW, &mut ctrl).unwrap_err();
        assert!(matches!(err, HsError::RetryBudgetExhausted { .. }));

        // The budget resets after the retry period.
        let later = NOW + INTRO_CIRC_RETRY_PERIOD_SECS;
        assert!(svc.launch_intro_circuit(&auth, later, &mut ctrl).is_ok());
    }

    #[test]
    fn test_introduce2_launches_rendezvous() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let (auth, intro_circ) = establish_one(&mut svc, &mut ctrl);
        let (cell_bytes, client_handshake) = valid_introduce2(&svc, auth);

        let rend_circ = svc
            .handle_introduce2(intro_circ, &cell_bytes, &mut ctrl)
            .unwrap()
            .expect("rendezvous launched");
        assert_eq!(
            svc.current_descriptor()
                .unwrap()
                .intro_point(&auth)
                .unwrap()
                .introduce2_count,
            1
        );

        // Rendezvous circuit opens; RENDEZVOUS1 carries the cookie and a
        // handshake info the client side completes successfully.
        svc.handle_rend_circuit_opened(rend_circ, &mut ctrl).unwrap();
        assert_eq!(ctrl.purpose_of(rend_circ), Some(CircuitPurpose::SRendJoined));
        let sent = ctrl.sent_cells(rend_circ);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, RelayCommand::Rendezvous1);
        let r1 = Rendezvous1::parse(&sent[0].1).unwrap();
        assert_eq!(r1.cookie, [0x77; 20]);
        let seed = client_handshake.complete(&r1.handshake_info).unwrap();
        let svc_seed = svc
            .rend_identifier(rend_circ)
            .unwrap()
            .rendezvous_ntor_key_seed
            .as_ref()
            .unwrap();
        assert_eq!(&seed[..], &svc_seed[..]);
    }

    #[test]
    fn test_introduce2_replay_counts_once() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let (auth, intro_circ) = establish_one(&mut svc, &mut ctrl);
        let (cell_bytes, _) = valid_introduce2(&svc, auth);

        svc.handle_introduce2(intro_circ, &cell_bytes, &mut ctrl)
            .unwrap()
            .expect("first INTRODUCE2 accepted");
        let second = svc
            .handle_introduce2(intro_circ, &cell_bytes, &mut ctrl)
            .unwrap();
        assert!(second.is_none(), "replay dropped");
        assert_eq!(
            svc.current_descriptor()
                .unwrap()
                .intro_point(&auth)
                .unwrap()
                .introduce2_count,
            1
        );
    }

    #[test]
    fn test_introduce2_wrong_auth_key_rejected() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let (auth, intro_circ) = establish_one(&mut svc, &mut ctrl);
        let (_, _) = valid_introduce2(&svc, auth);

        let mut cell = Introduce1::new_v3(vec![0xEE; 32], Vec::new(), vec![0u8; 96]);
        cell.encrypted = vec![0u8; 96];
        let bytes = cell.encode().unwrap();
        assert!(svc.handle_introduce2(intro_circ, &bytes, &mut ctrl).is_err());
    }

    #[test]
    fn test_intro_circuit_closed_unmarks() {
        let mut svc = service();
        let mut ctrl = MockController::new();
        let (auth, circ) = establish_one(&mut svc, &mut ctrl);
        svc.handle_intro_circuit_closed(circ);
        assert!(
            !svc.current_descriptor()
                .unwrap()
                .intro_point(&auth)
                .unwrap()
                .circuit_established
        );
    }
}
