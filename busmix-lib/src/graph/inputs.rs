//! Non-owning list of the connections feeding a bus.

use std::collections::HashMap;

use crate::ids::{ConnectionId, NodeId};

/// Connection ids with their sources; insertion and removal are O(1).
#[derive(Debug, Clone, Default)]
pub struct InputList {
    entries: Vec<(ConnectionId, NodeId)>,
    index: HashMap<ConnectionId, usize>,
}

impl InputList {
    /// Returns false when the connection is already listed.
    pub fn insert(&mut self, id: ConnectionId, source: NodeId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        self.index.insert(id, self.entries.len());
        self.entries.push((id, source));
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<NodeId> {
        let slot = self.index.remove(&id)?;
        let (_, source) = self.entries.swap_remove(slot);
        if let Some((moved, _)) = self.entries.get(slot) {
            self.index.insert(*moved, slot);
        }
        Some(source)
    }

    pub fn source_of(&self, id: ConnectionId) -> Option<NodeId> {
        self.index.get(&id).map(|slot| self.entries[*slot].1)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, NodeId)> + '_ {
        self.entries.iter().copied()
    }
}
