//! Shared-random state engine
//!
//! Holds the per-process protocol state, applies the per-round actions,
//! and computes the SRV at the end of each reveal phase. All mutations go
//! through `SrCoordinator`, which persists the state to disk after every
//! write so the on-disk view always equals the last committed memory view.

use std::collections::BTreeMap;
use std::path::Path;

use crate::crypto::hmac_sha256;
use crate::error::{HsError, Result};
use crate::protocol::vote::{
    CommitLine, SrvLine, SR_CURRENT_SRV_KEYWORD, SR_PREVIOUS_SRV_KEYWORD,
};
use crate::shared_random::{
    Commit, DiskState, SrPhase, Srv, SHARED_RANDOM_N_PHASES, SHARED_RANDOM_N_ROUNDS,
    SR_DISASTER_TOKEN, SR_PROTO_VERSION, SR_SRV_MIN_REVEAL, SR_SRV_TOKEN,
};

/// Total voting rounds in one protocol run.
const ROUNDS_PER_RUN: u64 = SHARED_RANDOM_N_ROUNDS * SHARED_RANDOM_N_PHASES;

/// Our own authority identity, used to generate and recognize our commit.
#[derive(Debug, Clone)]
pub struct AuthorityIdentity {
    /// Ed25519 SR identity public key.
    pub ed_identity: [u8; 32],
    /// Hex RSA fingerprint (40 chars, uppercase).
    pub rsa_fingerprint: String,
}

/// Given the consensus valid-after time, the protocol phase that round
/// belongs to: the first 12 rounds of a run are commit, the last 12 reveal.
pub fn phase_for_time(valid_after: u64, voting_interval: u64) -> SrPhase {
    let round_in_run = (valid_after / voting_interval) % ROUNDS_PER_RUN;
    if round_in_run < SHARED_RANDOM_N_ROUNDS {
        SrPhase::Commit
    } else {
        SrPhase::Reveal
    }
}

/// Expiry of a state serving the round at `valid_after`: the start of the
/// next protocol run.
pub fn state_valid_until(valid_after: u64, voting_interval: u64) -> u64 {
    let round_in_run = (valid_after / voting_interval) % ROUNDS_PER_RUN;
    let rounds_left = ROUNDS_PER_RUN - round_in_run;
    let round_start = valid_after - (valid_after % voting_interval);
    round_start + rounds_left * voting_interval
}

/// In-memory shared-random state. One per process.
#[derive(Debug, Clone)]
pub struct SrState {
    pub version: u32,
    pub phase: SrPhase,
    pub valid_after: u64,
    pub valid_until: u64,
    /// Commit map keyed by authority RSA fingerprint. Wiped at the start
    /// of every protocol run.
    commits: BTreeMap<String, Commit>,
    pub previous_srv: Option<Srv>,
    pub current_srv: Option<Srv>,
    pub n_commit_rounds: u64,
    pub n_reveal_rounds: u64,
    pub n_protocol_runs: u64,
    /// False when the current SRV came from the disaster branch.
    pub srv_fresh: bool,
}

impl SrState {
    fn new(valid_after: u64, voting_interval: u64) -> Self {
        Self {
            version: 1,
            phase: phase_for_time(valid_after, voting_interval),
            valid_after,
            valid_until: state_valid_until(valid_after, voting_interval),
            commits: BTreeMap::new(),
            previous_srv: None,
            current_srv: None,
            n_commit_rounds: 0,
            n_reveal_rounds: 0,
            n_protocol_runs: 0,
            srv_fresh: false,
        }
    }

    /// Ordered iterator over the commit map (ascending RSA fingerprint).
    pub fn commits(&self) -> impl Iterator<Item = (&String, &Commit)> {
        self.commits.iter()
    }

    pub fn commit(&self, rsa_fingerprint: &str) -> Option<&Commit> {
        self.commits.get(&rsa_fingerprint.to_uppercase())
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }
}

/// Compute the SRV from the commits that carry a verified reveal.
///
/// With at least `SR_SRV_MIN_REVEAL` reveals:
///   1. sort by the authority ed25519 base64 fingerprint, ascending,
///   2. `R = concat(fingerprint | encoded_reveal)` in that order,
///   3. `HASHED_REVEALS = SHA3-256(R)`,
///   4. `M = "shared-random" | INT_1(reveal_num) | INT_1(version) |
///      previous_srv` (32 zero bytes when there is no previous value),
///   5. `SRV = HMAC-SHA256(HASHED_REVEALS, M)`.
///
/// Below the floor the disaster value is produced instead:
/// `HMAC-SHA256(previous_srv, "shared-random-disaster")`, non-fresh.
fn compute_srv(state: &SrState) -> (Srv, bool) {
    let mut revealed: Vec<&Commit> = state
        .commits
        .values()
        .filter(|c| c.has_reveal() && c.ed_fingerprint.is_some())
        .collect();

    for commit in state.commits.values() {
        if commit.has_reveal() && commit.ed_fingerprint.is_none() {
            log::warn!(
                "commit from {} has a reveal but no ed25519 identity; skipping",
                commit.rsa_fingerprint
            );
        }
    }

    if revealed.len() < SR_SRV_MIN_REVEAL {
        log::warn!(
            "only {} valid reveal(s), below the protocol floor of {}; \
             computing disaster shared random value",
            revealed.len(),
            SR_SRV_MIN_REVEAL
        );
        let prev = state
            .previous_srv
            .as_ref()
            .map(|srv| srv.value)
            .unwrap_or([0u8; 32]);
        let value = hmac_sha256(&prev, &[SR_DISASTER_TOKEN]);
        return (
            Srv {
                num_reveals: revealed.len() as u64,
                value,
            },
            false,
        );
    }

    revealed.sort_by(|a, b| {
        a.ed_fingerprint
            .as_deref()
            .cmp(&b.ed_fingerprint.as_deref())
    });

    let mut reveals_buf = Vec::new();
    for commit in &revealed {
        // Both present by the filter above.
        if let (Some(fpr), Some(reveal)) = (&commit.ed_fingerprint, &commit.encoded_reveal) {
            reveals_buf.extend_from_slice(fpr.as_bytes());
            reveals_buf.extend_from_slice(reveal.as_bytes());
        }
    }
    let hashed_reveals = crate::crypto::sha3_256(&[&reveals_buf]);

    let prev = state
        .previous_srv
        .as_ref()
        .map(|srv| srv.value)
        .unwrap_or([0u8; 32]);
    let value = hmac_sha256(
        &hashed_reveals,
        &[
            SR_SRV_TOKEN,
            &[revealed.len() as u8],
            &[SR_PROTO_VERSION],
            &prev,
        ],
    );
    (
        Srv {
            num_reveals: revealed.len() as u64,
            value,
        },
        true,
    )
}

/// The coordinator owns the state, our identity, and the disk handle.
/// Every mutating operation is serialized through it and followed by a
/// disk write, so there is exactly one writer of the `sr-state` file.
pub struct SrCoordinator {
    state: SrState,
    identity: AuthorityIdentity,
    voting_interval: u64,
    disk: DiskState,
    /// Unknown keys read from disk, re-emitted verbatim on every save.
    extra: Vec<(String, String)>,
    save_to_disk: bool,
}

impl SrCoordinator {
    /// Initialize at startup: restore the state from the data directory,
    /// or start fresh when the file is missing, malformed or expired.
    /// Rejection of on-disk state is non-fatal and overwrites the file.
    pub fn init(
        data_dir: &Path,
        identity: AuthorityIdentity,
        voting_interval: u64,
        save_to_disk: bool,
        now: u64,
    ) -> Result<Self> {
        let disk = DiskState::in_dir(data_dir);
        let mut coordinator = match disk.load(now) {
            Ok(loaded) => {
                log::info!(
                    "restored shared-random state ({} commit(s), valid until {})",
                    loaded.commits.len(),
                    loaded.valid_until
                );
                let mut state = SrState::new(loaded.valid_after, voting_interval);
                state.version = loaded.version;
                state.valid_until = loaded.valid_until;
                state.previous_srv = loaded.previous_srv;
                state.current_srv = loaded.current_srv;
                // Mid-run restore: counters follow from the round position.
                let round_in_run = (loaded.valid_after / voting_interval) % ROUNDS_PER_RUN;
                if round_in_run < SHARED_RANDOM_N_ROUNDS {
                    state.n_commit_rounds = round_in_run + 1;
                } else {
                    state.n_commit_rounds = SHARED_RANDOM_N_ROUNDS;
                    state.n_reveal_rounds = round_in_run - SHARED_RANDOM_N_ROUNDS + 1;
                }
                state.n_protocol_runs = 1;
                for mut commit in loaded.commits {
                    // Our own commit regains its identity from our keys;
                    // peers' return with their next vote.
                    if commit.rsa_fingerprint == identity.rsa_fingerprint {
                        commit.ed_identity = Some(identity.ed_identity);
                        commit.ed_fingerprint = Some(ed_fingerprint_b64(&identity.ed_identity));
                    }
                    state
                        .commits
                        .insert(commit.rsa_fingerprint.clone(), commit);
                }
                Self {
                    state,
                    identity,
                    voting_interval,
                    disk,
                    extra: loaded.extra,
                    save_to_disk,
                }
            }
            Err(err) => {
                log::warn!(
                    "no usable shared-random state on disk ({}); starting fresh",
                    err
                );
                Self {
                    state: SrState::new(now, voting_interval),
                    identity,
                    voting_interval,
                    disk,
                    extra: Vec::new(),
                    save_to_disk,
                }
            }
        };
        coordinator.save()?;
        Ok(coordinator)
    }

    /// Read-only view of the state.
    pub fn state(&self) -> &SrState {
        &self.state
    }

    pub fn phase(&self) -> SrPhase {
        self.state.phase
    }

    pub fn current_srv(&self) -> Option<&Srv> {
        self.state.current_srv.as_ref()
    }

    pub fn previous_srv(&self) -> Option<&Srv> {
        self.state.previous_srv.as_ref()
    }

    fn is_booting(&self) -> bool {
        self.state.n_protocol_runs == 0
    }

    /// Per-round tick, called once by the voting scheduler for the round
    /// whose consensus is valid from `valid_after`.
    pub fn prepare_new_voting_period(&mut self, valid_after: u64) -> Result<()> {
        let new_phase = phase_for_time(valid_after, self.voting_interval);

        if new_phase != self.state.phase {
            match new_phase {
                // Leaving reveal: a new protocol run begins.
                SrPhase::Commit => self.new_protocol_run(),
                // Commit to reveal: no structural change, reveals are
                // simply accepted from here on.
                SrPhase::Reveal => {
                    debug_assert_eq!(self.state.n_reveal_rounds, 0);
                    log::info!("shared-random: transition to reveal phase");
                }
            }
            self.state.phase = new_phase;
        } else if self.is_booting() {
            self.new_protocol_run();
        }

        match self.state.phase {
            SrPhase::Commit => self.state.n_commit_rounds += 1,
            SrPhase::Reveal => self.state.n_reveal_rounds += 1,
        }

        // Commit-phase action: make sure we have our own commit this run.
        if self.state.phase == SrPhase::Commit
            && self
                .state
                .commits
                .get(&self.identity.rsa_fingerprint)
                .is_none()
        {
            let commit = Commit::generate(
                self.identity.ed_identity,
                self.identity.rsa_fingerprint.clone(),
                valid_after,
            );
            log::info!(
                "shared-random: generated our commitment for run #{}",
                self.state.n_protocol_runs
            );
            self.state
                .commits
                .insert(commit.rsa_fingerprint.clone(), commit);
        }

        self.state.valid_after = valid_after;
        self.state.valid_until = state_valid_until(valid_after, self.voting_interval);

        log::debug!(
            "shared-random: prepared round (phase {}, commit {}/{}, reveal {}/{})",
            self.state.phase.as_str(),
            self.state.n_commit_rounds,
            SHARED_RANDOM_N_ROUNDS,
            self.state.n_reveal_rounds,
            SHARED_RANDOM_N_ROUNDS
        );
        self.save()
    }

    /// First round of a new run: compute the SRV from the finished run,
    /// rotate the slots, wipe the commit map, reset the round counters.
    fn new_protocol_run(&mut self) {
        if self.state.phase == SrPhase::Reveal && !self.is_booting() {
            // Rotate first: the new value chains to the SRV that was
            // current during the run that just ended.
            self.state.previous_srv = self.state.current_srv.take();
            let (srv, fresh) = compute_srv(&self.state);
            log::info!(
                "shared-random: protocol run complete, new SRV from {} reveal(s){}",
                srv.num_reveals,
                if fresh { "" } else { " (disaster)" }
            );
            self.state.current_srv = Some(srv);
            self.state.srv_fresh = fresh;
        }

        self.state.n_commit_rounds = 0;
        self.state.n_reveal_rounds = 0;
        self.state.n_protocol_runs += 1;
        self.state.commits.clear();
        log::info!(
            "shared-random: protocol run #{} starting",
            self.state.n_protocol_runs
        );
    }

    /// Ingest every commit line of one peer vote. An authority may appear
    /// at most once per vote; later duplicates within the vote are
    /// dropped. Per-line rejections are logged and skipped so one broken
    /// line does not void the rest of the vote.
    pub fn ingest_vote(&mut self, lines: &[CommitLine]) -> Result<()> {
        let mut seen_in_vote: Vec<String> = Vec::new();
        let mut mutated = false;
        for line in lines {
            let fpr = line.rsa_fingerprint.to_uppercase();
            if seen_in_vote.contains(&fpr) {
                log::warn!(
                    "authority {} appears twice in one vote; dropping the duplicate",
                    fpr
                );
                continue;
            }
            seen_in_vote.push(fpr);
            match self.apply_commit_line(line) {
                Ok(changed) => mutated |= changed,
                Err(err) => log::warn!("rejecting commit line: {}", err),
            }
        }
        if mutated {
            self.save()?;
        }
        Ok(())
    }

    /// Ingest a single commit line, enforcing the phase rules. Returns
    /// whether the state changed. Public operations persist afterwards.
    pub fn ingest_commit_line(&mut self, line: &CommitLine) -> Result<()> {
        let mutated = self.apply_commit_line(line)?;
        if mutated {
            self.save()?;
        }
        Ok(())
    }

    fn apply_commit_line(&mut self, line: &CommitLine) -> Result<bool> {
        // Structural and crypto validation first (algorithm, identity,
        // blob layout, reveal-matches-commit).
        let incoming = Commit::from_commit_line(line)?;

        // A reveal value has no business in the commit phase.
        if incoming.has_reveal() && self.state.phase == SrPhase::Commit {
            return Err(HsError::CommitRejected(format!(
                "reveal from {} during commit phase",
                incoming.rsa_fingerprint
            )));
        }

        match self.state.commits.get_mut(&incoming.rsa_fingerprint) {
            None => {
                // The reveal phase accepts reveal attachments only, never
                // new commitments.
                if self.state.phase == SrPhase::Reveal {
                    return Err(HsError::CommitRejected(format!(
                        "new commit from {} during reveal phase",
                        incoming.rsa_fingerprint
                    )));
                }
                log::debug!("storing commit from {}", incoming.rsa_fingerprint);
                self.state
                    .commits
                    .insert(incoming.rsa_fingerprint.clone(), incoming);
                Ok(true)
            }
            Some(existing) => {
                if !existing.same_commitment(&incoming) {
                    // Same authority, structurally different commit: the
                    // earliest stays, the later one is refused.
                    return Err(HsError::ConflictingCommit {
                        fingerprint: incoming.rsa_fingerprint.clone(),
                    });
                }
                let mut mutated = false;
                // A disk-restored commit regains its identity from the
                // first vote that repeats it.
                if existing.ed_identity.is_none() {
                    existing.ed_identity = incoming.ed_identity;
                    existing.ed_fingerprint = incoming.ed_fingerprint.clone();
                    mutated = true;
                }
                if let (Some(reveal), false) = (&line.reveal_b64, existing.has_reveal()) {
                    existing.attach_reveal(reveal)?;
                    log::debug!("attached reveal from {}", existing.rsa_fingerprint);
                    mutated = true;
                }
                // Identical duplicate: idempotent.
                Ok(mutated)
            }
        }
    }

    /// Lines for our outgoing vote: one commit line per stored commit
    /// (reveals only exposed in reveal phase) followed by the SRV lines.
    pub fn vote_lines(&self) -> Vec<String> {
        let include_reveal = self.state.phase == SrPhase::Reveal;
        let mut out = Vec::new();
        for (_, commit) in self.state.commits() {
            // Commits without an ed identity cannot be re-voted yet.
            if let Some(line) = commit.to_commit_line() {
                out.push(line.to_vote_line(include_reveal));
            }
        }
        if let Some(srv) = &self.state.previous_srv {
            let line = SrvLine {
                num_reveals: srv.num_reveals,
                value: srv.value,
            };
            out.push(line.to_vote_line(SR_PREVIOUS_SRV_KEYWORD));
        }
        if let Some(srv) = &self.state.current_srv {
            let line = SrvLine {
                num_reveals: srv.num_reveals,
                value: srv.value,
            };
            out.push(line.to_vote_line(SR_CURRENT_SRV_KEYWORD));
        }
        out
    }

    /// Persist the in-memory state. Called after every mutation.
    fn save(&mut self) -> Result<()> {
        if !self.save_to_disk {
            return Ok(());
        }
        let commits: Vec<&Commit> = self.state.commits.values().collect();
        self.disk.save(
            self.state.valid_after,
            self.state.valid_until,
            &commits,
            self.state.previous_srv.as_ref(),
            self.state.current_srv.as_ref(),
            &self.extra,
        )
    }

    /// Write out and drop the state at shutdown.
    pub fn save_and_shutdown(mut self) -> Result<()> {
        self.save()
    }
}

fn ed_fingerprint_b64(identity: &[u8; 32]) -> String {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine as _;
    STANDARD_NO_PAD.encode(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: u64 = 3600;

    fn identity(byte: u8) -> AuthorityIdentity {
        AuthorityIdentity {
            ed_identity: [byte; 32],
            rsa_fingerprint: format!("{:02X}", byte).repeat(20),
        }
    }

    fn coordinator_at(dir: &Path, valid_after: u64) -> SrCoordinator {
        let mut c = SrCoordinator::init(dir, identity(0xaa), V, true, valid_after).unwrap();
        c.prepare_new_voting_period(valid_after).unwrap();
        c
    }

    #[test]
    fn test_phase_timeline() {
        // Round 0..11 commit, 12..23 reveal, then a new run.
        for round in 0..24 {
            let phase = phase_for_time(round * V, V);
            if round < 12 {
                assert_eq!(phase, SrPhase::Commit, "round {}", round);
            } else {
                assert_eq!(phase, SrPhase::Reveal, "round {}", round);
            }
        }
        assert_eq!(phase_for_time(24 * V, V), SrPhase::Commit);
    }

    #[test]
    fn test_valid_until_is_next_run_start() {
        assert_eq!(state_valid_until(0, V), 24 * V);
        assert_eq!(state_valid_until(5 * V + 17, V), 24 * V);
        assert_eq!(state_valid_until(23 * V, V), 24 * V);
        assert_eq!(state_valid_until(24 * V, V), 48 * V);
    }

    #[test]
    fn test_own_commit_generated_in_commit_phase() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator_at(dir.path(), 0);
        assert_eq!(c.state().commit_count(), 1);
        let ours = c.state().commit(&identity(0xaa).rsa_fingerprint).unwrap();
        assert!(ours.has_reveal());
        assert_eq!(ours.commit_ts, 0);
    }

    #[test]
    fn test_phase_monotonicity_over_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let mut observed = vec![c.phase()];
        for round in 1..25 {
            c.prepare_new_voting_period(round * V).unwrap();
            observed.push(c.phase());
        }
        // Commit*, then Reveal*, then Commit again at the run boundary.
        let first_reveal = observed.iter().position(|p| *p == SrPhase::Reveal).unwrap();
        assert_eq!(first_reveal, 12);
        assert!(observed[..12].iter().all(|p| *p == SrPhase::Commit));
        assert!(observed[12..24].iter().all(|p| *p == SrPhase::Reveal));
        assert_eq!(observed[24], SrPhase::Commit);
    }

    #[test]
    fn test_commit_map_wiped_on_new_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let peer = Commit::generate([1; 32], "11".repeat(20), 0);
        c.ingest_commit_line(&CommitLine {
            reveal_b64: None,
            ..peer.to_commit_line().unwrap()
        })
        .unwrap();
        assert_eq!(c.state().commit_count(), 2);

        for round in 1..=24 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        // New run: map wiped, only our fresh commit remains.
        assert_eq!(c.state().commit_count(), 1);
        assert_eq!(c.state().n_protocol_runs, 2);
    }

    #[test]
    fn test_reveal_rejected_in_commit_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let peer = Commit::generate([1; 32], "11".repeat(20), 0);
        let line = peer.to_commit_line().unwrap();
        assert!(line.reveal_b64.is_some());
        let err = c.ingest_commit_line(&line).unwrap_err();
        assert!(matches!(err, HsError::CommitRejected(_)));
    }

    #[test]
    fn test_new_commit_rejected_in_reveal_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 12 * V);
        assert_eq!(c.phase(), SrPhase::Reveal);
        let peer = Commit::generate([1; 32], "11".repeat(20), 12 * V);
        let mut line = peer.to_commit_line().unwrap();
        line.reveal_b64 = None;
        let err = c.ingest_commit_line(&line).unwrap_err();
        assert!(matches!(err, HsError::CommitRejected(_)));
    }

    #[test]
    fn test_commit_then_reveal_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 11 * V);
        let peer = Commit::generate([1; 32], "11".repeat(20), 11 * V);
        let full_line = peer.to_commit_line().unwrap();

        // Commit phase: commit without reveal.
        let mut commit_only = full_line.clone();
        commit_only.reveal_b64 = None;
        c.ingest_commit_line(&commit_only).unwrap();
        assert!(!c.state().commit("11".repeat(20).as_str()).unwrap().has_reveal());

        // Reveal phase: the same line with the reveal attaches it.
        c.prepare_new_voting_period(12 * V).unwrap();
        c.ingest_commit_line(&full_line).unwrap();
        assert!(c.state().commit("11".repeat(20).as_str()).unwrap().has_reveal());
    }

    #[test]
    fn test_commit_ingest_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let peer = Commit::generate([1; 32], "11".repeat(20), 0);
        let mut line = peer.to_commit_line().unwrap();
        line.reveal_b64 = None;
        c.ingest_commit_line(&line).unwrap();
        let snapshot = c.state().commit_count();
        c.ingest_commit_line(&line).unwrap();
        c.ingest_commit_line(&line).unwrap();
        assert_eq!(c.state().commit_count(), snapshot);
    }

    #[test]
    fn test_conflicting_commit_keeps_earliest() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let first = Commit::generate([1; 32], "11".repeat(20), 0);
        let second = Commit::generate([1; 32], "11".repeat(20), 0);
        let mut line1 = first.to_commit_line().unwrap();
        line1.reveal_b64 = None;
        let mut line2 = second.to_commit_line().unwrap();
        line2.reveal_b64 = None;

        c.ingest_commit_line(&line1).unwrap();
        let err = c.ingest_commit_line(&line2).unwrap_err();
        assert!(matches!(err, HsError::ConflictingCommit { .. }));
        let kept = c.state().commit("11".repeat(20).as_str()).unwrap();
        assert_eq!(kept.encoded_commit, first.encoded_commit);
    }

    #[test]
    fn test_duplicate_authority_in_one_vote_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        let first = Commit::generate([1; 32], "11".repeat(20), 0);
        let second = Commit::generate([1; 32], "11".repeat(20), 0);
        let mut line1 = first.to_commit_line().unwrap();
        line1.reveal_b64 = None;
        let mut line2 = second.to_commit_line().unwrap();
        line2.reveal_b64 = None;

        c.ingest_vote(&[line1, line2]).unwrap();
        let kept = c.state().commit("11".repeat(20).as_str()).unwrap();
        assert_eq!(kept.encoded_commit, first.encoded_commit);
    }

    #[test]
    fn test_srv_computed_at_run_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        // Three peers (we are the fourth).
        let peers: Vec<Commit> = (1u8..=3)
            .map(|i| Commit::generate([i; 32], format!("{:02X}", i).repeat(20), 0))
            .collect();
        for peer in &peers {
            let mut line = peer.to_commit_line().unwrap();
            line.reveal_b64 = None;
            c.ingest_commit_line(&line).unwrap();
        }
        for round in 1..=12 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        for peer in &peers {
            c.ingest_commit_line(&peer.to_commit_line().unwrap()).unwrap();
        }
        for round in 13..=24 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        let srv = c.current_srv().expect("SRV after run end");
        assert_eq!(srv.num_reveals, 4);
        assert!(c.state().srv_fresh);
    }

    #[test]
    fn test_disaster_branch_below_floor() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        // Only our own reveal: 1 < 3.
        for round in 1..=24 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        let srv = c.current_srv().expect("disaster SRV");
        assert!(!c.state().srv_fresh);
        assert_eq!(srv.num_reveals, 1);
        // previous_srv was absent, so the key is all-zero.
        let expected = hmac_sha256(&[0u8; 32], &[SR_DISASTER_TOKEN]);
        assert_eq!(srv.value, expected);
    }

    #[test]
    fn test_srv_rotation_current_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 0);
        for round in 1..=24 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        let first = c.current_srv().unwrap().clone();
        for round in 25..=48 {
            c.prepare_new_voting_period(round * V).unwrap();
        }
        assert_eq!(c.previous_srv(), Some(&first));
        assert_ne!(c.current_srv(), Some(&first));
    }

    #[test]
    fn test_vote_lines_hide_reveal_in_commit_phase() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator_at(dir.path(), 0);
        let lines = c.vote_lines();
        assert_eq!(lines.len(), 1);
        let tokens: Vec<&str> = lines[0].split_whitespace().collect();
        // keyword alg identity fpr commit -- no reveal token.
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn test_vote_lines_show_reveal_in_reveal_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator_at(dir.path(), 11 * V);
        c.prepare_new_voting_period(12 * V).unwrap();
        let lines = c.vote_lines();
        let tokens: Vec<&str> = lines[0].split_whitespace().collect();
        assert_eq!(tokens.len(), 6);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = coordinator_at(dir.path(), 0);
        let our_commit = first
            .state()
            .commit(&identity(0xaa).rsa_fingerprint)
            .unwrap()
            .clone();
        drop(first);

        let restored = SrCoordinator::init(dir.path(), identity(0xaa), V, true, V).unwrap();
        let commit = restored
            .state()
            .commit(&identity(0xaa).rsa_fingerprint)
            .expect("our commit restored");
        assert!(commit.same_commitment(&our_commit));
        // Our own identity is re-attached from our keys.
        assert!(commit.ed_identity.is_some());
    }

    #[test]
    fn test_corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::shared_random::SR_STATE_FILENAME),
            b"garbage",
        )
        .unwrap();
        let c = SrCoordinator::init(dir.path(), identity(0xaa), V, true, 0).unwrap();
        assert_eq!(c.state().commit_count(), 0);
        assert_eq!(c.state().n_protocol_runs, 0);
    }
}
