//! Persistent shared-random state (`sr-state` file)
//!
//! Line-oriented UTF-8 text, one `Key value` pair per line, `#` comments
//! and blank lines tolerated. Unknown keys are preserved verbatim in an
//! `__extra` bucket and re-emitted on save, so additions from a newer
//! implementation survive a round-trip through this one.
//!
//! Writes are atomic: the file is rebuilt from the in-memory state into a
//! temporary file and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::{HsError, Result};
use crate::protocol::vote::SrvLine;
use crate::shared_random::{Commit, Srv};

/// Filename of the state inside the data directory.
pub const SR_STATE_FILENAME: &str = "sr-state";

/// Highest state-file version we can read.
pub const SR_STATE_VERSION_MAX: u32 = 1;

/// Version we write.
pub const SR_STATE_VERSION: u32 = 1;

const KEY_VERSION: &str = "Version";
const KEY_VALID_AFTER: &str = "ValidAfter";
const KEY_VALID_UNTIL: &str = "ValidUntil";
const KEY_COMMIT: &str = "Commit";
const KEY_PREV_SRV: &str = "SharedRandPreviousValue";
const KEY_CUR_SRV: &str = "SharedRandCurrentValue";

const ISO_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Format a unix timestamp as ISO-8601 UTC (`2016-04-13 00:00:00`).
pub fn format_iso_time(secs: u64) -> Result<String> {
    let dt = OffsetDateTime::from_unix_timestamp(secs as i64)
        .map_err(|e| HsError::Internal(format!("timestamp {} out of range: {}", secs, e)))?;
    dt.format(&ISO_FORMAT)
        .map_err(|e| HsError::Internal(format!("time formatting: {}", e)))
}

/// Parse an ISO-8601 UTC timestamp back to unix seconds.
pub fn parse_iso_time(s: &str) -> Result<u64> {
    let dt = PrimitiveDateTime::parse(s, &ISO_FORMAT)
        .map_err(|e| HsError::StateInvalid(format!("bad ISO time {:?}: {}", s, e)))?;
    let ts = dt.assume_utc().unix_timestamp();
    if ts < 0 {
        return Err(HsError::StateInvalid(format!("pre-epoch time {:?}", s)));
    }
    Ok(ts as u64)
}

/// Everything a valid state file contains.
#[derive(Debug, Clone)]
pub struct LoadedState {
    pub version: u32,
    pub valid_after: u64,
    pub valid_until: u64,
    pub commits: Vec<Commit>,
    pub previous_srv: Option<Srv>,
    pub current_srv: Option<Srv>,
    /// Unrecognized `(key, value)` lines, preserved in file order.
    pub extra: Vec<(String, String)>,
}

/// Handle on the on-disk state location.
#[derive(Debug, Clone)]
pub struct DiskState {
    path: PathBuf,
}

impl DiskState {
    /// State handle rooted in the given data directory.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SR_STATE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse and validate the state file. Any structural or freshness
    /// failure is a `Persistence` error; the caller replaces the state
    /// with a fresh one and overwrites the file.
    pub fn load(&self, now: u64) -> Result<LoadedState> {
        let content = fs::read_to_string(&self.path)?;
        Self::parse(&content, now)
    }

    fn parse(content: &str, now: u64) -> Result<LoadedState> {
        let mut version: Option<u32> = None;
        let mut valid_after: Option<u64> = None;
        let mut valid_until: Option<u64> = None;
        let mut commits = Vec::new();
        let mut previous_srv = None;
        let mut current_srv = None;
        let mut extra = Vec::new();

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            match key {
                KEY_VERSION => {
                    let v: u32 = value.parse().map_err(|_| {
                        HsError::StateInvalid(format!("bad Version {:?}", value))
                    })?;
                    if v > SR_STATE_VERSION_MAX {
                        return Err(HsError::StateInvalid(format!(
                            "Version {} is newer than supported {}",
                            v, SR_STATE_VERSION_MAX
                        )));
                    }
                    version = Some(v);
                }
                KEY_VALID_AFTER => valid_after = Some(parse_iso_time(value)?),
                KEY_VALID_UNTIL => valid_until = Some(parse_iso_time(value)?),
                KEY_COMMIT => {
                    let tokens: Vec<&str> = value.split_whitespace().collect();
                    commits.push(Commit::from_disk_tokens(&tokens).map_err(|e| {
                        HsError::StateInvalid(format!("commit line: {}", e))
                    })?);
                }
                KEY_PREV_SRV | KEY_CUR_SRV => {
                    let tokens: Vec<&str> = value.split_whitespace().collect();
                    let srv_line = SrvLine::from_tokens(&tokens)
                        .map_err(|e| HsError::StateInvalid(format!("SRV line: {}", e)))?;
                    let srv = Srv {
                        num_reveals: srv_line.num_reveals,
                        value: srv_line.value,
                    };
                    if key == KEY_PREV_SRV {
                        previous_srv = Some(srv);
                    } else {
                        current_srv = Some(srv);
                    }
                }
                _ => extra.push((key.to_string(), value.to_string())),
            }
        }

        let version =
            version.ok_or_else(|| HsError::StateInvalid("missing Version line".into()))?;
        let valid_after =
            valid_after.ok_or_else(|| HsError::StateInvalid("missing ValidAfter".into()))?;
        let valid_until =
            valid_until.ok_or_else(|| HsError::StateInvalid("missing ValidUntil".into()))?;

        if valid_until < now {
            return Err(HsError::StateInvalid(format!(
                "state expired at {}",
                format_iso_time(valid_until)?
            )));
        }
        if valid_after >= valid_until {
            return Err(HsError::StateInvalid(
                "ValidAfter is not before ValidUntil".into(),
            ));
        }

        Ok(LoadedState {
            version,
            valid_after,
            valid_until,
            commits,
            previous_srv,
            current_srv,
            extra,
        })
    }

    /// Rebuild the file content from the in-memory view and write it
    /// atomically (write to `<path>.tmp`, then rename).
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        valid_after: u64,
        valid_until: u64,
        commits: &[&Commit],
        previous_srv: Option<&Srv>,
        current_srv: Option<&Srv>,
        extra: &[(String, String)],
    ) -> Result<()> {
        let mut out = String::new();
        out.push_str("# Shared randomness protocol state. This file is generated\n");
        out.push_str("# and rewritten by the shared-random subsystem. Do not edit.\n");
        out.push_str(&format!("{} {}\n", KEY_VERSION, SR_STATE_VERSION));
        out.push_str(&format!(
            "{} {}\n",
            KEY_VALID_AFTER,
            format_iso_time(valid_after)?
        ));
        out.push_str(&format!(
            "{} {}\n",
            KEY_VALID_UNTIL,
            format_iso_time(valid_until)?
        ));
        for commit in commits {
            out.push_str(&format!("{} {}\n", KEY_COMMIT, commit.to_disk_value()));
        }
        if let Some(srv) = previous_srv {
            let line = SrvLine {
                num_reveals: srv.num_reveals,
                value: srv.value,
            };
            out.push_str(&format!("{} {}\n", KEY_PREV_SRV, line.value_string()));
        }
        if let Some(srv) = current_srv {
            let line = SrvLine {
                num_reveals: srv.num_reveals,
                value: srv.value,
            };
            out.push_str(&format!("{} {}\n", KEY_CUR_SRV, line.value_string()));
        }
        for (key, value) in extra {
            out.push_str(&format!("{} {}\n", key, value));
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, out.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("wrote shared-random state to {}", self.path.display());
        Ok(())
    }
}
