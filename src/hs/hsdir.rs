//! HSDir index derivation and responsible-directory selection
//!
//! Every HSDir gets a position on a hash ring from its identity, the SRV
//! and the time period; every service descriptor gets one position per
//! replica. The responsible directories for a descriptor are the first
//! `spread` unique nodes clockwise from each replica index.

use crate::crypto::sha3_256;

const HSDIR_INDEX_PREFIX: &[u8] = b"node-idx";
const HS_INDEX_PREFIX: &[u8] = b"store-at-idx";

/// One HSDir on the hash ring: node identity and derived ring index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsDirEntry {
    pub node_id: [u8; 32],
    pub index: [u8; 32],
}

/// Ring index of an HSDir node:
/// `SHA3-256("node-idx" | node_identity | srv | INT_8(period_num) |
/// INT_8(period_length))`.
pub fn build_hsdir_index(
    node_identity: &[u8; 32],
    srv: &[u8; 32],
    period_num: u64,
    period_length_secs: u64,
) -> [u8; 32] {
    sha3_256(&[
        HSDIR_INDEX_PREFIX,
        node_identity,
        srv,
        &period_num.to_be_bytes(),
        &period_length_secs.to_be_bytes(),
    ])
}

/// Ring index of a descriptor replica:
/// `SHA3-256("store-at-idx" | blinded_pk | INT_8(replica) |
/// INT_8(period_length) | INT_8(period_num))`.
pub fn build_hs_index(
    replica: u64,
    blinded_pk: &[u8; 32],
    period_num: u64,
    period_length_secs: u64,
) -> [u8; 32] {
    sha3_256(&[
        HS_INDEX_PREFIX,
        blinded_pk,
        &replica.to_be_bytes(),
        &period_length_secs.to_be_bytes(),
        &period_num.to_be_bytes(),
    ])
}

/// Select the responsible HSDirs for a descriptor.
///
/// The ring is sorted by index; for each replica `1..=n_replicas` the walk
/// starts at the first node at or clockwise of the replica's hs index and
/// collects `spread` nodes, skipping ones already chosen for an earlier
/// replica. Returns the node identities in selection order.
pub fn responsible_hsdirs(
    ring: &[HsDirEntry],
    blinded_pk: &[u8; 32],
    period_num: u64,
    period_length_secs: u64,
    n_replicas: u64,
    spread: usize,
) -> Vec<[u8; 32]> {
    let mut sorted: Vec<&HsDirEntry> = ring.iter().collect();
    sorted.sort_by(|a, b| a.index.cmp(&b.index));

    let mut chosen: Vec<[u8; 32]> = Vec::new();
    for replica in 1..=n_replicas {
        let hs_index = build_hs_index(replica, blinded_pk, period_num, period_length_secs);
        let start = sorted.partition_point(|entry| entry.index < hs_index);
        let mut picked = 0usize;
        for offset in 0..sorted.len() {
            if picked >= spread {
                break;
            }
            let entry = sorted[(start + offset) % sorted.len()];
            if chosen.contains(&entry.node_id) {
                continue;
            }
            chosen.push(entry.node_id);
            picked += 1;
        }
    }
    chosen
}
