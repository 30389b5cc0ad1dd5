//! Per-object write serialization.
//!
//! Object ids are hashed into a fixed bucket of mutexes; at most one writer
//! per object runs at any instant on this node. Recovery shares these locks
//! with the I/O path so a pull and a client write on the same oid cannot
//! interleave.

use corelib::hash::oid_hash;
use parking_lot::{Mutex, MutexGuard};

const NR_BUCKETS: usize = 64;

pub struct OidLocks {
    buckets: Vec<Mutex<()>>,
}

impl Default for OidLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl OidLocks {
    pub fn new() -> Self {
        Self {
            buckets: (0..NR_BUCKETS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, oid: u64) -> MutexGuard<'_, ()> {
        self.buckets[oid_hash(oid) as usize % NR_BUCKETS].lock()
    }
}
