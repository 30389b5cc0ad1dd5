//! The replicated vdi registry.
//!
//! Name to id mappings, snapshot lineage, and lock state. Mutations arrive
//! only through ordered vdi ops, so every member holds an identical
//! registry; reads (vdi listing, info, id lookups) are served locally from
//! any node.

use std::collections::BTreeMap;

use corelib::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use store::vdi::probe_seq;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiState {
    pub vdi_id: u32,
    pub size: u64,
    pub ctime: u64,
    pub parent_vdi_id: u32,
    pub snap_id: u32,
    pub copies: u32,
    pub locked_by: Option<NodeId>,
}

#[derive(Default)]
pub struct VdiRegistry {
    by_name: BTreeMap<String, VdiState>,
    names_by_id: BTreeMap<u32, String>,
}

impl VdiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VdiState> {
        self.by_name.get(name)
    }

    pub fn name_of(&self, vdi_id: u32) -> Option<&str> {
        self.names_by_id.get(&vdi_id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VdiState)> {
        self.by_name.iter()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// First free id on the probe sequence of `name`.
    fn allocate_id(&self, name: &str) -> Result<u32> {
        probe_seq(name)
            .find(|id| !self.names_by_id.contains_key(id))
            .ok_or(Error::FullVdi)
    }

    /// Apply an ordered create. Deterministic: every member allocates the
    /// same id because every member sees the same registry.
    pub fn create(
        &mut self,
        name: &str,
        size: u64,
        ctime: u64,
        parent_vdi_id: u32,
        snap_id: u32,
        copies: u32,
    ) -> Result<VdiState> {
        if self.by_name.contains_key(name) {
            return Err(Error::VdiExists);
        }
        let vdi_id = self.allocate_id(name)?;
        let state = VdiState {
            vdi_id,
            size,
            ctime,
            parent_vdi_id,
            snap_id,
            copies,
            locked_by: None,
        };
        self.by_name.insert(name.to_string(), state.clone());
        self.names_by_id.insert(vdi_id, name.to_string());
        Ok(state)
    }

    /// Re-seed an entry from a recovered inode object (registry rebuild on
    /// restart). Existing entries win; ordered ops are fresher than disk.
    pub fn seed(&mut self, name: &str, state: VdiState) {
        if self.by_name.contains_key(name) || self.names_by_id.contains_key(&state.vdi_id) {
            return;
        }
        self.names_by_id.insert(state.vdi_id, name.to_string());
        self.by_name.insert(name.to_string(), state);
    }

    /// Apply an ordered delete, returning the removed state so callers can
    /// sweep the data objects.
    pub fn delete(&mut self, name: &str) -> Result<VdiState> {
        let state = self.by_name.remove(name).ok_or(Error::NoVdi)?;
        self.names_by_id.remove(&state.vdi_id);
        Ok(state)
    }

    pub fn lock(&mut self, name: &str, owner: NodeId) -> Result<()> {
        let state = self.by_name.get_mut(name).ok_or(Error::NoVdi)?;
        match state.locked_by {
            Some(holder) if holder != owner => Err(Error::VdiLocked),
            _ => {
                state.locked_by = Some(owner);
                Ok(())
            }
        }
    }

    pub fn release(&mut self, name: &str, owner: NodeId) -> Result<()> {
        let state = self.by_name.get_mut(name).ok_or(Error::NoVdi)?;
        match state.locked_by {
            Some(holder) if holder == owner => {
                state.locked_by = None;
                Ok(())
            }
            _ => Err(Error::VdiLocked),
        }
    }

    /// Snapshot for transfer to a joining node.
    pub fn export(&self) -> Vec<(String, VdiState)> {
        self.by_name
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }

    /// Replace-style load of a transferred snapshot (joiner side; the
    /// answering member's registry is authoritative).
    pub fn import(&mut self, entries: Vec<(String, VdiState)>) {
        for (name, state) in entries {
            self.names_by_id.insert(state.vdi_id, name.clone());
            self.by_name.insert(name, state);
        }
    }

    /// Drop every lock held by a departed node.
    pub fn release_all(&mut self, owner: NodeId) {
        for state in self.by_name.values_mut() {
            if state.locked_by == Some(owner) {
                state.locked_by = None;
            }
        }
    }
}
