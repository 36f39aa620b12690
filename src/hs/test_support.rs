//! Mock circuit/directory/stream implementations for unit tests.

use std::collections::HashMap;

use crate::error::{HsError, Result};
use crate::hs::ident::{CircuitHandle, CircuitPurpose};
use crate::hs::{
    CircuitController, CloseReason, HsDirEntry, NodeDirectory, StreamFailReason, StreamLayer,
};
use crate::protocol::{LinkSpecifier, RelayCommand};

/// Records every call the state machines make against the circuit layer.
pub(crate) struct MockController {
    next_handle: u64,
    pub launched: Vec<(CircuitHandle, CircuitPurpose, Vec<LinkSpecifier>, bool)>,
    pub sent: Vec<(CircuitHandle, RelayCommand, Vec<u8>)>,
    pub purposes: HashMap<CircuitHandle, CircuitPurpose>,
    pub closed: HashMap<CircuitHandle, CloseReason>,
    pub repurposed: Vec<CircuitHandle>,
    pub dirty: HashMap<CircuitHandle, u64>,
    /// When set, `send_relay_cell` fails and closes the circuit, the way
    /// the real circuit layer reports a dead circuit.
    pub fail_send: bool,
    /// When set, `launch_circuit` reports failure.
    pub fail_launch: bool,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            launched: Vec::new(),
            sent: Vec::new(),
            purposes: HashMap::new(),
            closed: HashMap::new(),
            repurposed: Vec::new(),
            dirty: HashMap::new(),
            fail_send: false,
            fail_launch: false,
        }
    }

    pub fn sent_cells(&self, circuit: CircuitHandle) -> Vec<(RelayCommand, Vec<u8>)> {
        self.sent
            .iter()
            .filter(|(c, _, _)| *c == circuit)
            .map(|(_, cmd, body)| (*cmd, body.clone()))
            .collect()
    }

    pub fn purpose_of(&self, circuit: CircuitHandle) -> Option<CircuitPurpose> {
        self.purposes.get(&circuit).copied()
    }

    pub fn close_reason(&self, circuit: CircuitHandle) -> Option<CloseReason> {
        self.closed.get(&circuit).copied()
    }

    pub fn last_launched(&self) -> Option<CircuitHandle> {
        self.launched.last().map(|(handle, _, _, _)| *handle)
    }
}

impl CircuitController for MockController {
    fn launch_circuit(
        &mut self,
        purpose: CircuitPurpose,
        target: &[LinkSpecifier],
        one_hop: bool,
    ) -> Result<CircuitHandle> {
        if self.fail_launch {
            return Err(HsError::CircuitClosed("launch refused".into()));
        }
        let handle = CircuitHandle(self.next_handle);
        self.next_handle += 1;
        self.launched
            .push((handle, purpose, target.to_vec(), one_hop));
        self.purposes.insert(handle, purpose);
        Ok(handle)
    }

    fn send_relay_cell(
        &mut self,
        circuit: CircuitHandle,
        command: RelayCommand,
        body: &[u8],
    ) -> Result<()> {
        if self.fail_send {
            self.closed.insert(circuit, CloseReason::Internal);
            return Err(HsError::CircuitClosed("send failed".into()));
        }
        self.sent.push((circuit, command, body.to_vec()));
        Ok(())
    }

    fn change_purpose(&mut self, circuit: CircuitHandle, purpose: CircuitPurpose) {
        self.purposes.insert(circuit, purpose);
    }

    fn repurpose_general(&mut self, circuit: CircuitHandle) {
        self.repurposed.push(circuit);
        self.purposes.remove(&circuit);
    }

    fn close_circuit(&mut self, circuit: CircuitHandle, reason: CloseReason) {
        self.closed.entry(circuit).or_insert(reason);
    }

    fn mark_dirty(&mut self, circuit: CircuitHandle, now: u64) {
        self.dirty.insert(circuit, now);
    }
}

/// Directory mock: a set of known nodes, an exclude set, and a canned ring.
pub(crate) struct MockDirectory {
    pub nodes: Vec<[u8; 32]>,
    pub excluded: Vec<[u8; 32]>,
    pub ring: Vec<HsDirEntry>,
}

impl MockDirectory {
    pub fn with_nodes(nodes: Vec<[u8; 32]>) -> Self {
        Self {
            nodes,
            excluded: Vec::new(),
            ring: Vec::new(),
        }
    }
}

impl NodeDirectory for MockDirectory {
    fn contains(&self, node_id: &[u8; 32]) -> bool {
        self.nodes.contains(node_id)
    }

    fn is_excluded(&self, node_id: &[u8; 32]) -> bool {
        self.excluded.contains(node_id)
    }

    fn hsdir_ring(
        &self,
        _srv: &[u8; 32],
        _period_num: u64,
        _period_length_secs: u64,
    ) -> Vec<HsDirEntry> {
        self.ring.clone()
    }
}

/// Stream-layer mock recording the notifications.
#[derive(Default)]
pub(crate) struct MockStreams {
    pub awaiting_descriptor: Vec<[u8; 32]>,
    pub resumed: Vec<[u8; 32]>,
    pub attached: Vec<([u8; 32], CircuitHandle)>,
    pub failed: Vec<([u8; 32], StreamFailReason)>,
}

impl StreamLayer for MockStreams {
    fn flag_streams_await_descriptor(&mut self, service_pk: &[u8; 32]) {
        self.awaiting_descriptor.push(*service_pk);
    }

    fn resume_waiting_streams(&mut self, service_pk: &[u8; 32]) {
        self.resumed.push(*service_pk);
    }

    fn attach_waiting_streams(&mut self, service_pk: &[u8; 32], circuit: CircuitHandle) {
        self.attached.push((*service_pk, circuit));
    }

    fn fail_streams(&mut self, service_pk: &[u8; 32], reason: StreamFailReason) {
        self.failed.push((*service_pk, reason));
    }
}
