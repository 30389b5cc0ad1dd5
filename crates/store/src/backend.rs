//! The on-disk object store.
//!
//! One file per object under `<dir>/objects/`, named by the zero-padded hex
//! oid. Copies displaced by an epoch change are renamed into
//! `objects/.stale/<oid>.<epoch>` until recovery has handed them off, then
//! swept. File presence is the source of truth for every higher layer;
//! operations here are idempotent so recovery can replay them.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use corelib::hash::oid_hash;
use corelib::{ClusterConfig, Error, Result};

use crate::lock::OidLocks;

pub struct ObjectStore {
    obj_dir: PathBuf,
    stale_dir: PathBuf,
    locks: OidLocks,
    write_cache: bool,
    /// Advertised capacity in bytes, 0 for unlimited.
    capacity: u64,
    /// Approximate live bytes, seeded by a scan at open and adjusted on
    /// create/remove. Extending writes are not tracked; the cap is an
    /// admission guard, not an accountant.
    used: AtomicU64,
}

impl ObjectStore {
    pub fn open(base: &Path, config: &ClusterConfig) -> Result<Self> {
        let obj_dir = base.join("objects");
        let stale_dir = obj_dir.join(".stale");
        fs::create_dir_all(&stale_dir)?;
        let mut used = 0u64;
        for entry in fs::read_dir(&obj_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                used += entry.metadata()?.len();
            }
        }
        Ok(Self {
            obj_dir,
            stale_dir,
            locks: OidLocks::new(),
            write_cache: config.write_cache,
            capacity: config.disk_space,
            used: AtomicU64::new(used),
        })
    }

    fn obj_path(&self, oid: u64) -> PathBuf {
        self.obj_dir.join(format!("{oid:016x}"))
    }

    fn stale_path(&self, oid: u64, epoch: u32) -> PathBuf {
        self.stale_dir.join(format!("{oid:016x}.{epoch}"))
    }

    pub fn exists(&self, oid: u64) -> bool {
        self.obj_path(oid).exists()
    }

    /// Read up to `len` bytes at `offset`; the result is shorter when the
    /// object ends first.
    pub fn read(&self, oid: u64, offset: u32, len: u32) -> Result<Vec<u8>> {
        let _guard = self.locks.lock(oid);
        read_at(&self.obj_path(oid), offset, len)
    }

    /// Write `data` at `offset`. With `create` the object must not exist
    /// yet; without it, it must.
    pub fn write(&self, oid: u64, offset: u32, data: &[u8], create: bool) -> Result<()> {
        let _guard = self.locks.lock(oid);
        if create
            && self.capacity > 0
            && self.used.load(Ordering::Relaxed) + data.len() as u64 > self.capacity
        {
            tracing::warn!(
                oid = format_args!("{oid:016x}"),
                used = self.used.load(Ordering::Relaxed),
                capacity = self.capacity,
                "create rejected, store is full"
            );
            return Err(Error::NoSpace);
        }
        let mut opts = OpenOptions::new();
        opts.write(true);
        if create {
            opts.create_new(true);
        }
        let mut file = opts.open(self.obj_path(oid)).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::ObjectExists,
            std::io::ErrorKind::NotFound => Error::NoObject,
            _ => Error::Io(e),
        })?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        if !self.write_cache {
            file.sync_data()?;
        }
        if create {
            self.used.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn remove(&self, oid: u64) -> Result<()> {
        let _guard = self.locks.lock(oid);
        let path = self.obj_path(oid);
        let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(path) {
            Ok(()) => {
                self.used.fetch_sub(len.min(self.used.load(Ordering::Relaxed)), Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoObject),
            Err(e) => Err(e.into()),
        }
    }

    /// Every live oid on this node.
    pub fn list(&self) -> Result<Vec<u64>> {
        let mut oids = Vec::new();
        for entry in fs::read_dir(&self.obj_dir)? {
            let entry = entry?;
            if let Some(oid) = entry
                .file_name()
                .to_str()
                .and_then(|name| u64::from_str_radix(name, 16).ok())
            {
                oids.push(oid);
            }
        }
        oids.sort_unstable();
        Ok(oids)
    }

    /// Local oids whose ring position falls within `[start, end]`,
    /// wrapping around the id space when `start > end`.
    pub fn list_range(&self, start: u64, end: u64) -> Result<Vec<u64>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|oid| {
                let pos = oid_hash(*oid);
                if start <= end {
                    pos >= start && pos <= end
                } else {
                    pos >= start || pos <= end
                }
            })
            .collect())
    }

    /// Displace a live copy this node no longer owns; it stays readable for
    /// epoch-`epoch` recovery reads until swept.
    pub fn mark_stale(&self, oid: u64, epoch: u32) -> Result<()> {
        let _guard = self.locks.lock(oid);
        match fs::rename(self.obj_path(oid), self.stale_path(oid, epoch)) {
            Ok(()) => {
                tracing::debug!(oid = format_args!("{oid:016x}"), epoch, "copy displaced");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoObject),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a displaced copy stamped with `epoch`, falling back to the live
    /// object (a copy that stayed owned was never renamed).
    pub fn read_stale(&self, oid: u64, epoch: u32, offset: u32, len: u32) -> Result<Vec<u8>> {
        let _guard = self.locks.lock(oid);
        match read_at(&self.stale_path(oid, epoch), offset, len) {
            Err(Error::NoObject) => read_at(&self.obj_path(oid), offset, len),
            other => other,
        }
    }

    /// Unlink one displaced copy once its hand-off is confirmed.
    pub fn remove_stale(&self, oid: u64, epoch: u32) -> Result<()> {
        match fs::remove_file(self.stale_path(oid, epoch)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoObject),
            Err(e) => Err(e.into()),
        }
    }

    /// Unlink displaced copies at or below `upto_epoch`. Returns how many
    /// were removed.
    pub fn sweep_stale(&self, upto_epoch: u32) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.stale_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((oid, epoch)) = name.split_once('.') else { continue };
            let Some(oid) = u64::from_str_radix(oid, 16).ok() else { continue };
            let Some(epoch) = epoch.parse::<u32>().ok() else { continue };
            if epoch <= upto_epoch && self.remove_stale(oid, epoch).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, upto_epoch, "stale copies swept");
        }
        Ok(removed)
    }

    /// Count of displaced copies still waiting for the sweep.
    pub fn stale_count(&self) -> Result<usize> {
        Ok(fs::read_dir(&self.stale_dir)?.count())
    }

    pub fn locks(&self) -> &OidLocks {
        &self.locks
    }
}

fn read_at(path: &Path, offset: u32, len: u32) -> Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NoObject),
        Err(e) => return Err(e.into()),
    };
    // The allocation is bounded by what the object actually holds, so a
    // caller may ask for "everything" with a large len.
    let avail = file.metadata()?.len().saturating_sub(offset as u64);
    let len = (len as u64).min(avail) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
