//! Virtual disk images.
//!
//! A vdi is an inode object mapping 4 MiB slots to data objects, plus the
//! data objects themselves. Ids live in a 24-bit space derived from the
//! name; collisions resolve by linear probe. Snapshot chains are immutable:
//! a write on a snapshot copies the backing slot into a fresh data object
//! owned by the child vdi.

use corelib::hash::{fnv_64a, FNV1A_64_INIT};
use corelib::{Error, Result, DATA_OBJ_SIZE};
use serde::{Deserialize, Serialize};

/// Width of the vdi id space.
pub const VDI_BITS: u32 = 24;
pub const NR_VDIS: u32 = 1 << VDI_BITS;

/// Probe attempts before a create gives up with `full-vdi`.
pub const MAX_VDI_PROBES: u32 = 4096;

/// Largest vdi the inode table will describe (4 MiB slots).
pub const MAX_DATA_OBJS: u64 = 1 << 20;

/// Oid of the inode object of `vdi_id`.
pub fn inode_oid(vdi_id: u32) -> u64 {
    (vdi_id as u64) << 32
}

/// Oid of data slot `idx` of `vdi_id`. Slot numbering starts at 1 in the
/// low word so the inode oid itself is never aliased.
pub fn data_oid(vdi_id: u32, idx: u32) -> u64 {
    inode_oid(vdi_id) | (idx as u64 + 1)
}

pub fn oid_vdi_id(oid: u64) -> u32 {
    (oid >> 32) as u32
}

pub fn is_inode_oid(oid: u64) -> bool {
    oid & 0xffff_ffff == 0
}

/// First candidate id for `name`.
pub fn name_hash(name: &str) -> u32 {
    (fnv_64a(name.as_bytes(), FNV1A_64_INIT) % NR_VDIS as u64) as u32
}

/// The id probe sequence for `name`: `MAX_VDI_PROBES` consecutive slots
/// starting at the name hash, wrapping in id space. Id 0 is reserved and
/// skipped.
pub fn probe_seq(name: &str) -> impl Iterator<Item = u32> {
    let base = name_hash(name);
    (0..MAX_VDI_PROBES)
        .map(move |i| (base.wrapping_add(i)) % NR_VDIS)
        .filter(|id| *id != 0)
}

/// The inode record stored as a vdi's metadata object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiInode {
    pub name: String,
    pub vdi_id: u32,
    pub size: u64,
    pub ctime: u64,
    /// Parent in the snapshot chain, 0 for a base image.
    pub parent_vdi_id: u32,
    pub snap_id: u32,
    pub copies: u32,
    /// Per data slot, the vdi whose object backs it: this vdi after a local
    /// write, an ancestor while the slot is still shared, 0 when unwritten.
    pub data_vdi_ids: Vec<u32>,
}

impl VdiInode {
    pub fn new(
        name: impl Into<String>,
        vdi_id: u32,
        size: u64,
        ctime: u64,
        parent_vdi_id: u32,
        snap_id: u32,
        copies: u32,
    ) -> Result<Self> {
        let nr_objs = size.div_ceil(DATA_OBJ_SIZE);
        if nr_objs > MAX_DATA_OBJS {
            return Err(Error::InvalidParms(format!("vdi size {size} too large")));
        }
        Ok(Self {
            name: name.into(),
            vdi_id,
            size,
            ctime,
            parent_vdi_id,
            snap_id,
            copies,
            data_vdi_ids: vec![0; nr_objs as usize],
        })
    }

    pub fn nr_data_objs(&self) -> usize {
        self.data_vdi_ids.len()
    }

    /// Oid backing data slot `idx`, `None` while unwritten.
    pub fn data_oid_at(&self, idx: usize) -> Option<u64> {
        match self.data_vdi_ids.get(idx) {
            Some(0) | None => None,
            Some(owner) => Some(data_oid(*owner, idx as u32)),
        }
    }

    /// Record that slot `idx` is now backed by this vdi's own object.
    pub fn allocate(&mut self, idx: usize) -> Result<u64> {
        if idx >= self.data_vdi_ids.len() {
            return Err(Error::InvalidParms(format!("data slot {idx} out of range")));
        }
        self.data_vdi_ids[idx] = self.vdi_id;
        Ok(data_oid(self.vdi_id, idx as u32))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::System(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::System(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_tagging_is_disjoint() {
        let vdi = 0x00ab_cdef;
        assert!(is_inode_oid(inode_oid(vdi)));
        assert!(!is_inode_oid(data_oid(vdi, 0)));
        assert_eq!(oid_vdi_id(inode_oid(vdi)), vdi);
        assert_eq!(oid_vdi_id(data_oid(vdi, 7)), vdi);
        assert_ne!(data_oid(vdi, 0), inode_oid(vdi));
    }

    #[test]
    fn test_probe_seq_starts_at_name_hash() {
        let first = probe_seq("alice").next().unwrap();
        let expected = name_hash("alice");
        if expected != 0 {
            assert_eq!(first, expected);
        }
    }

    #[test]
    fn test_probe_seq_is_bounded_and_skips_zero() {
        let ids: Vec<u32> = probe_seq("bob").collect();
        assert!(ids.len() <= MAX_VDI_PROBES as usize);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_inode_roundtrip() {
        let mut inode =
            VdiInode::new("test", 42, 12 << 20, 1_700_000_000, 0, 1, 2).unwrap();
        assert_eq!(inode.nr_data_objs(), 3);
        assert_eq!(inode.data_oid_at(0), None);
        let oid = inode.allocate(0).unwrap();
        assert_eq!(oid, data_oid(42, 0));
        assert_eq!(inode.data_oid_at(0), Some(oid));

        let decoded = VdiInode::decode(&inode.encode().unwrap()).unwrap();
        assert_eq!(decoded, inode);
    }

    #[test]
    fn test_snapshot_slot_points_at_parent() {
        let mut child = VdiInode::new("img", 5, 8 << 20, 0, 4, 2, 1).unwrap();
        child.data_vdi_ids[1] = 4;
        assert_eq!(child.data_oid_at(1), Some(data_oid(4, 1)));
    }

    #[test]
    fn test_oversized_vdi_rejected() {
        assert!(VdiInode::new("big", 1, u64::MAX, 0, 0, 1, 1).is_err());
    }
}
