//! A bounded cache of peers that recently failed to answer a request, so
//! the lookup engine can skip them instead of paying a full request
//! timeout against the same dead end repeatedly.

use crate::node::NodeId;
use indexmap::IndexMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a peer stays flagged unresponsive after its last failure.
pub const UNRESPONSIVE_TTL: Duration = Duration::from_secs(300);

/// Upper bound on tracked entries; a node that misbehaves this much is
/// vanishingly unlikely to still matter once the cache is this full.
const CAPACITY: usize = 4096;

pub struct UnresponsivePeers {
    entries: Mutex<IndexMap<NodeId, Instant>>,
}

impl Default for UnresponsivePeers {
    fn default() -> Self {
        Self::new()
    }
}

impl UnresponsivePeers {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn mark_unresponsive(&self, node_id: NodeId) {
        let mut entries = self.entries.lock().expect("unresponsive cache lock poisoned");
        entries.insert(node_id, Instant::now());
        while entries.len() > CAPACITY {
            entries.shift_remove_index(0);
        }
    }

    pub fn clear(&self, node_id: NodeId) {
        self.entries
            .lock()
            .expect("unresponsive cache lock poisoned")
            .shift_remove(&node_id);
    }

    /// `true` if `node_id` failed to respond within the last
    /// [`UNRESPONSIVE_TTL`]. Also lazily drops the entry once it expires.
    pub fn is_unresponsive(&self, node_id: NodeId) -> bool {
        let mut entries = self.entries.lock().expect("unresponsive cache lock poisoned");
        match entries.get(&node_id) {
            Some(marked_at) if marked_at.elapsed() < UNRESPONSIVE_TTL => true,
            Some(_) => {
                entries.shift_remove(&node_id);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("unresponsive cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
