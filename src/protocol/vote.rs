//! Text lines for the shared-random protocol
//!
//! Votes carry one `shared-rand-commit` line per known commit and up to two
//! SRV lines. The persisted state file reuses the same commit/reveal blob
//! encodings with a shorter line syntax (no ed25519 identity).
//!
//! Blob layouts (before base64):
//! - commit: `H(REVEAL)` (32) | timestamp (8, BE)
//! - reveal: timestamp (8, BE) | random number (32)

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;

use crate::error::{HsError, Result};

/// Keyword of a commit line in a vote.
pub const SR_COMMIT_KEYWORD: &str = "shared-rand-commit";
/// Keyword of the previous-SRV line in a vote.
pub const SR_PREVIOUS_SRV_KEYWORD: &str = "shared-rand-previous-value";
/// Keyword of the current-SRV line in a vote.
pub const SR_CURRENT_SRV_KEYWORD: &str = "shared-rand-current-value";

/// The only digest algorithm label the protocol accepts.
pub const SR_DIGEST_ALG_NAME: &str = "sha3-256";

/// Decoded length of a commit blob.
pub const COMMIT_BLOB_LEN: usize = 32 + 8;
/// Decoded length of a reveal blob.
pub const REVEAL_BLOB_LEN: usize = 8 + 32;

fn b64_decode(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .map_err(|e| HsError::CommitParse(format!("base64: {}", e)))
}

/// Encode a commit blob (`hashed_reveal | timestamp`) as base64.
pub fn commit_blob_encode(hashed_reveal: &[u8; 32], timestamp: u64) -> String {
    let mut blob = [0u8; COMMIT_BLOB_LEN];
    blob[..32].copy_from_slice(hashed_reveal);
    blob[32..].copy_from_slice(&timestamp.to_be_bytes());
    STANDARD.encode(blob)
}

/// Decode a base64 commit blob into `(hashed_reveal, timestamp)`.
pub fn commit_blob_decode(encoded: &str) -> Result<([u8; 32], u64)> {
    let raw = b64_decode(encoded)?;
    if raw.len() != COMMIT_BLOB_LEN {
        return Err(HsError::CommitParse(format!(
            "commit blob is {} bytes, want {}",
            raw.len(),
            COMMIT_BLOB_LEN
        )));
    }
    let mut hashed_reveal = [0u8; 32];
    hashed_reveal.copy_from_slice(&raw[..32]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[32..]);
    Ok((hashed_reveal, u64::from_be_bytes(ts)))
}

/// Encode a reveal blob (`timestamp | random_number`) as base64.
pub fn reveal_blob_encode(timestamp: u64, random_number: &[u8; 32]) -> String {
    let mut blob = [0u8; REVEAL_BLOB_LEN];
    blob[..8].copy_from_slice(&timestamp.to_be_bytes());
    blob[8..].copy_from_slice(random_number);
    STANDARD.encode(blob)
}

/// Decode a base64 reveal blob into `(timestamp, random_number)`.
pub fn reveal_blob_decode(encoded: &str) -> Result<(u64, [u8; 32])> {
    let raw = b64_decode(encoded)?;
    if raw.len() != REVEAL_BLOB_LEN {
        return Err(HsError::CommitParse(format!(
            "reveal blob is {} bytes, want {}",
            raw.len(),
            REVEAL_BLOB_LEN
        )));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[..8]);
    let mut random_number = [0u8; 32];
    random_number.copy_from_slice(&raw[8..]);
    Ok((u64::from_be_bytes(ts), random_number))
}

/// One `shared-rand-commit` line, tokenized but not yet validated against
/// the protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLine {
    /// Digest algorithm label; anything but sha3-256 is rejected upstream.
    pub alg: String,
    /// Base64 ed25519 SR identity of the authority.
    pub ed_identity_b64: String,
    /// Hex RSA fingerprint of the authority (40 chars).
    pub rsa_fingerprint: String,
    /// Base64 commit blob, kept byte-exact for re-emission.
    pub commit_b64: String,
    /// Base64 reveal blob if the line carried one.
    pub reveal_b64: Option<String>,
}

impl CommitLine {
    /// Parse the whitespace-separated tokens after the keyword.
    pub fn from_tokens(tokens: &[&str]) -> Result<Self> {
        if tokens.len() < 4 || tokens.len() > 5 {
            return Err(HsError::CommitParse(format!(
                "{} token(s) in commit line",
                tokens.len()
            )));
        }
        let line = Self {
            alg: tokens[0].to_string(),
            ed_identity_b64: tokens[1].to_string(),
            rsa_fingerprint: tokens[2].to_string(),
            commit_b64: tokens[3].to_string(),
            reveal_b64: tokens.get(4).map(|s| s.to_string()),
        };
        line.validate_structure()?;
        Ok(line)
    }

    /// Parse a whole vote line, keyword included.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(SR_COMMIT_KEYWORD) => {}
            other => {
                return Err(HsError::CommitParse(format!(
                    "expected {}, got {:?}",
                    SR_COMMIT_KEYWORD, other
                )))
            }
        }
        let rest: Vec<&str> = tokens.collect();
        Self::from_tokens(&rest)
    }

    fn validate_structure(&self) -> Result<()> {
        if self.rsa_fingerprint.len() != 40
            || !self.rsa_fingerprint.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(HsError::CommitParse(format!(
                "bad RSA fingerprint {:?}",
                self.rsa_fingerprint
            )));
        }
        // Commit blob must decode; a reveal blob too when present.
        commit_blob_decode(&self.commit_b64)?;
        if let Some(reveal) = &self.reveal_b64 {
            reveal_blob_decode(reveal)?;
        }
        Ok(())
    }

    /// Decode the ed25519 identity from its base64 form.
    pub fn ed_identity(&self) -> Result<[u8; 32]> {
        let raw = b64_decode(&self.ed_identity_b64)?;
        raw.try_into()
            .map_err(|_| HsError::CommitParse("ed25519 identity is not 32 bytes".into()))
    }

    /// Format the full vote line. `include_reveal` is false in commit phase.
    pub fn to_vote_line(&self, include_reveal: bool) -> String {
        match (&self.reveal_b64, include_reveal) {
            (Some(reveal), true) => format!(
                "{} {} {} {} {} {}",
                SR_COMMIT_KEYWORD,
                self.alg,
                self.ed_identity_b64,
                self.rsa_fingerprint,
                self.commit_b64,
                reveal
            ),
            _ => format!(
                "{} {} {} {} {}",
                SR_COMMIT_KEYWORD,
                self.alg,
                self.ed_identity_b64,
                self.rsa_fingerprint,
                self.commit_b64
            ),
        }
    }
}

/// A shared random value as it appears on an SRV line:
/// `<num_reveals> <hex32>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvLine {
    pub num_reveals: u64,
    pub value: [u8; 32],
}

impl SrvLine {
    /// Parse the tokens after the keyword. `num_reveals` is unsigned on the
    /// wire; a leading minus is a parse error.
    pub fn from_tokens(tokens: &[&str]) -> Result<Self> {
        if tokens.len() != 2 {
            return Err(HsError::CommitParse(format!(
                "{} token(s) in SRV line",
                tokens.len()
            )));
        }
        let num_reveals: u64 = tokens[0]
            .parse()
            .map_err(|_| HsError::CommitParse(format!("bad num_reveals {:?}", tokens[0])))?;
        let raw = hex::decode(tokens[1])
            .map_err(|_| HsError::CommitParse(format!("bad SRV hex {:?}", tokens[1])))?;
        let value: [u8; 32] = raw
            .try_into()
            .map_err(|_| HsError::CommitParse("SRV value is not 32 bytes".into()))?;
        Ok(Self { num_reveals, value })
    }

    /// Format the value part of the line (without keyword).
    pub fn value_string(&self) -> String {
        format!("{} {}", self.num_reveals, hex::encode_upper(self.value))
    }

    /// Format a full vote line with the given keyword.
    pub fn to_vote_line(&self, keyword: &str) -> String {
        format!("{} {}", keyword, self.value_string())
    }
}
