//! Commit objects for the shared-random protocol
//!
//! A commit binds one authority to a random number through
//! `H(reveal) | timestamp`, revealed in the second protocol phase. The
//! base64 blobs are kept byte-exact as received so our vote re-emits
//! exactly what the authority published.

use zeroize::Zeroizing;

use crate::crypto::{rand_bytes, sha3_256};
use crate::error::{HsError, Result};
use crate::protocol::vote::{
    commit_blob_decode, commit_blob_encode, reveal_blob_encode, CommitLine, SR_DIGEST_ALG_NAME,
};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

/// One authority's commit (and, after the reveal phase exposes it, the
/// matching reveal) for the current protocol run.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Digest algorithm label; only sha3-256 is valid.
    pub alg: String,
    /// Ed25519 SR identity of the authority. Present for commits taken
    /// from votes or generated locally; absent right after a disk load
    /// until the authority's next vote re-supplies it.
    pub ed_identity: Option<[u8; 32]>,
    /// Base64 form of the identity; the SRV computation sort key.
    pub ed_fingerprint: Option<String>,
    /// Hex RSA fingerprint; the state keys its commit map by this.
    pub rsa_fingerprint: String,
    /// Commit timestamp (seconds).
    pub commit_ts: u64,
    /// `H(encoded_reveal)`.
    pub hashed_reveal: [u8; 32],
    /// The commit blob exactly as received, for re-emission.
    pub encoded_commit: String,
    /// Reveal timestamp, once revealed. Must equal `commit_ts`.
    pub reveal_ts: Option<u64>,
    /// The committed random number, once revealed. Wiped on drop.
    pub random_number: Option<Zeroizing<[u8; 32]>>,
    /// The reveal blob exactly as received.
    pub encoded_reveal: Option<String>,
}

impl Commit {
    /// Generate our own commit for the protocol run starting at
    /// `timestamp`: a fresh random number, its encoded reveal, and the
    /// hash committing to it.
    pub fn generate(ed_identity: [u8; 32], rsa_fingerprint: String, timestamp: u64) -> Self {
        let random_number: [u8; 32] = rand_bytes();
        let encoded_reveal = reveal_blob_encode(timestamp, &random_number);
        let hashed_reveal = sha3_256(&[encoded_reveal.as_bytes()]);
        let encoded_commit = commit_blob_encode(&hashed_reveal, timestamp);
        Self {
            alg: SR_DIGEST_ALG_NAME.to_string(),
            ed_identity: Some(ed_identity),
            ed_fingerprint: Some(STANDARD_NO_PAD.encode(ed_identity)),
            rsa_fingerprint,
            commit_ts: timestamp,
            hashed_reveal,
            encoded_commit,
            reveal_ts: Some(timestamp),
            random_number: Some(Zeroizing::new(random_number)),
            encoded_reveal: Some(encoded_reveal),
        }
    }

    /// Build a commit from a parsed vote line. The reveal, if present, is
    /// verified against the commit. The digest algorithm and identity are
    /// validated here; phase rules belong to the state engine.
    pub fn from_commit_line(line: &CommitLine) -> Result<Self> {
        if line.alg != SR_DIGEST_ALG_NAME {
            return Err(HsError::CommitRejected(format!(
                "unsupported digest algorithm {:?}",
                line.alg
            )));
        }
        let ed_identity = line.ed_identity()?;
        let (hashed_reveal, commit_ts) = commit_blob_decode(&line.commit_b64)?;
        let mut commit = Self {
            alg: line.alg.clone(),
            ed_identity: Some(ed_identity),
            ed_fingerprint: Some(line.ed_identity_b64.clone()),
            rsa_fingerprint: line.rsa_fingerprint.to_uppercase(),
            commit_ts,
            hashed_reveal,
            encoded_commit: line.commit_b64.clone(),
            reveal_ts: None,
            random_number: None,
            encoded_reveal: None,
        };
        if let Some(reveal_b64) = &line.reveal_b64 {
            commit.attach_reveal(reveal_b64)?;
        }
        Ok(commit)
    }

    /// Build a commit from a disk-state line (`alg fpr commit [reveal]`),
    /// which carries no ed25519 identity.
    pub fn from_disk_tokens(tokens: &[&str]) -> Result<Self> {
        if tokens.len() < 3 || tokens.len() > 4 {
            return Err(HsError::CommitParse(format!(
                "{} token(s) in state commit line",
                tokens.len()
            )));
        }
        if tokens[0] != SR_DIGEST_ALG_NAME {
            return Err(HsError::CommitRejected(format!(
                "unsupported digest algorithm {:?}",
                tokens[0]
            )));
        }
        let rsa_fingerprint = tokens[1].to_string();
        if rsa_fingerprint.len() != 40 || !rsa_fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HsError::CommitParse(format!(
                "bad RSA fingerprint {:?}",
                rsa_fingerprint
            )));
        }
        let (hashed_reveal, commit_ts) = commit_blob_decode(tokens[2])?;
        let mut commit = Self {
            alg: tokens[0].to_string(),
            ed_identity: None,
            ed_fingerprint: None,
            rsa_fingerprint: rsa_fingerprint.to_uppercase(),
            commit_ts,
            hashed_reveal,
            encoded_commit: tokens[2].to_string(),
            reveal_ts: None,
            random_number: None,
            encoded_reveal: None,
        };
        if let Some(reveal) = tokens.get(3) {
            commit.attach_reveal(reveal)?;
        }
        Ok(commit)
    }

    /// Attach and verify a reveal blob: the hash of the encoded reveal
    /// must equal the committed hash and the timestamps must agree.
    pub fn attach_reveal(&mut self, reveal_b64: &str) -> Result<()> {
        let (reveal_ts, random_number) =
            crate::protocol::vote::reveal_blob_decode(reveal_b64)?;
        let hashed = sha3_256(&[reveal_b64.as_bytes()]);
        if hashed != self.hashed_reveal {
            return Err(HsError::CommitRejected(format!(
                "reveal of {} does not hash to its commitment",
                self.rsa_fingerprint
            )));
        }
        if reveal_ts != self.commit_ts {
            return Err(HsError::CommitRejected(format!(
                "reveal timestamp {} != commit timestamp {} for {}",
                reveal_ts, self.commit_ts, self.rsa_fingerprint
            )));
        }
        self.reveal_ts = Some(reveal_ts);
        self.random_number = Some(Zeroizing::new(random_number));
        self.encoded_reveal = Some(reveal_b64.to_string());
        Ok(())
    }

    /// True once the commit carries a verified reveal.
    pub fn has_reveal(&self) -> bool {
        self.encoded_reveal.is_some()
    }

    /// Whether two commits are the same commitment (identical blob from
    /// the same authority). A matching pair with and without reveal still
    /// counts as the same commitment.
    pub fn same_commitment(&self, other: &Commit) -> bool {
        self.rsa_fingerprint == other.rsa_fingerprint
            && self.encoded_commit == other.encoded_commit
    }

    /// Vote-line representation of this commit. Returns `None` when the
    /// ed25519 identity is unknown (disk-restored commit not yet refreshed
    /// by a vote); such commits are withheld from our vote.
    pub fn to_commit_line(&self) -> Option<CommitLine> {
        let ed_fingerprint = self.ed_fingerprint.clone()?;
        Some(CommitLine {
            alg: self.alg.clone(),
            ed_identity_b64: ed_fingerprint,
            rsa_fingerprint: self.rsa_fingerprint.clone(),
            commit_b64: self.encoded_commit.clone(),
            reveal_b64: self.encoded_reveal.clone(),
        })
    }

    /// Disk-state representation: `<alg> <fpr> <commit> [<reveal>]`.
    pub fn to_disk_value(&self) -> String {
        match &self.encoded_reveal {
            Some(reveal) => format!(
                "{} {} {} {}",
                self.alg, self.rsa_fingerprint, self.encoded_commit, reveal
            ),
            None => format!("{} {} {}", self.alg, self.rsa_fingerprint, self.encoded_commit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vote::reveal_blob_decode;

    #[test]
    fn test_generate_is_self_consistent() {
        let commit = Commit::generate([7; 32], "A".repeat(40), 1000);
        assert!(commit.has_reveal());
        let reveal = commit.encoded_reveal.as_ref().unwrap();
        let (ts, rn) = reveal_blob_decode(reveal).unwrap();
        assert_eq!(ts, 1000);
        assert_eq!(&rn, &commit.random_number.as_ref().unwrap()[..]);
        assert_eq!(sha3_256(&[reveal.as_bytes()]), commit.hashed_reveal);
    }

    #[test]
    fn test_vote_line_round_trip() {
        let commit = Commit::generate([7; 32], "B".repeat(40), 55);
        let line = commit.to_commit_line().unwrap();
        let back = Commit::from_commit_line(&line).unwrap();
        assert!(back.same_commitment(&commit));
        assert!(back.has_reveal());
        assert_eq!(back.commit_ts, 55);
    }

    #[test]
    fn test_attach_wrong_reveal_rejected() {
        let commit_a = Commit::generate([1; 32], "A".repeat(40), 10);
        let commit_b = Commit::generate([2; 32], "B".repeat(40), 10);
        let mut stripped = commit_a.clone();
        stripped.reveal_ts = None;
        stripped.random_number = None;
        stripped.encoded_reveal = None;
        let err = stripped
            .attach_reveal(commit_b.encoded_reveal.as_ref().unwrap())
            .unwrap_err();
        assert!(matches!(err, HsError::CommitRejected(_)));
    }

    #[test]
    fn test_timestamp_mismatch_rejected() {
        let commit = Commit::generate([1; 32], "A".repeat(40), 10);
        let rn = commit.random_number.as_ref().unwrap();
        // Re-encode the right random number under the wrong timestamp;
        // the hash check fires first since the blob differs.
        let wrong = reveal_blob_encode(11, &{
            let mut copy = [0u8; 32];
            copy.copy_from_slice(&rn[..]);
            copy
        });
        let mut stripped = commit.clone();
        stripped.reveal_ts = None;
        stripped.random_number = None;
        stripped.encoded_reveal = None;
        assert!(stripped.attach_reveal(&wrong).is_err());
    }

    #[test]
    fn test_disk_round_trip_drops_identity() {
        let commit = Commit::generate([9; 32], "C".repeat(40), 77);
        let value = commit.to_disk_value();
        let tokens: Vec<&str> = value.split_whitespace().collect();
        let back = Commit::from_disk_tokens(&tokens).unwrap();
        assert!(back.same_commitment(&commit));
        assert!(back.has_reveal());
        assert!(back.ed_identity.is_none());
        assert!(back.to_commit_line().is_none());
    }

    #[test]
    fn test_bad_alg_rejected() {
        let commit = Commit::generate([9; 32], "D".repeat(40), 1);
        let mut line = commit.to_commit_line().unwrap();
        line.alg = "sha256".into();
        assert!(matches!(
            Commit::from_commit_line(&line).unwrap_err(),
            HsError::CommitRejected(_)
        ));
    }
}
