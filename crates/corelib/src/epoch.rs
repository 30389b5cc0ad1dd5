//! The epoch log: append-only membership snapshots on stable storage.
//!
//! One file per epoch, named by the zero-padded epoch number, holding the
//! packed node records of the membership at that epoch. The cluster creation
//! time lives in a separate `ctime` file. An entry must be durable before
//! the in-memory epoch pointer advances past it; a torn entry (size not a
//! multiple of the record size) reads back as "not present".

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::node::{Node, NODE_RECORD_SIZE};

const CTIME_FILE: &str = "ctime";
const COPIES_FILE: &str = "copies";

pub struct EpochLog {
    dir: PathBuf,
}

impl EpochLog {
    /// Open (creating if needed) the epoch directory under `base`.
    pub fn open(base: &Path) -> Result<Self> {
        let dir = base.join("epoch");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!("{:08}", epoch))
    }

    /// Persist the membership snapshot for `epoch`. Durable on return.
    pub fn append(&self, epoch: u32, nodes: &[Node]) -> Result<()> {
        if epoch == 0 {
            return Err(Error::InvalidEpoch(0));
        }
        let mut buf = BytesMut::with_capacity(nodes.len() * NODE_RECORD_SIZE);
        for n in nodes {
            n.encode(&mut buf);
        }
        let mut file = File::create(self.entry_path(epoch))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the membership snapshot recorded for `epoch`.
    pub fn read(&self, epoch: u32) -> Result<Vec<Node>> {
        let mut data = Vec::new();
        match File::open(self.entry_path(epoch)) {
            Ok(mut f) => {
                f.read_to_end(&mut data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InvalidEpoch(epoch));
            }
            Err(e) => return Err(e.into()),
        }
        // A torn write is indistinguishable from a missing entry.
        if data.is_empty() || data.len() % NODE_RECORD_SIZE != 0 {
            return Err(Error::InvalidEpoch(epoch));
        }
        let mut buf = &data[..];
        let mut nodes = Vec::with_capacity(data.len() / NODE_RECORD_SIZE);
        while buf.has_remaining() {
            nodes.push(Node::decode(&mut buf)?);
        }
        Ok(nodes)
    }

    /// The largest epoch with a recorded entry, 0 when the log is empty
    /// (the node has never been part of a formatted cluster).
    pub fn latest(&self) -> Result<u32> {
        let mut latest = 0u32;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(epoch) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                latest = latest.max(epoch);
            }
        }
        Ok(latest)
    }

    pub fn remove(&self, epoch: u32) -> Result<()> {
        match fs::remove_file(self.entry_path(epoch)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the cluster creation time. Immutable once set: rewriting the
    /// same value is allowed, changing it is not.
    pub fn set_ctime(&self, ctime: u64) -> Result<()> {
        match self.ctime()? {
            0 => {}
            existing if existing == ctime => return Ok(()),
            _ => return Err(Error::InvalidCtime),
        }
        let mut file = File::create(self.dir.join(CTIME_FILE))?;
        file.write_all(&ctime.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// The recorded cluster creation time, 0 when unset.
    pub fn ctime(&self) -> Result<u64> {
        let mut data = [0u8; 8];
        match File::open(self.dir.join(CTIME_FILE)) {
            Ok(mut f) => {
                f.read_exact(&mut data)?;
                Ok(u64::from_le_bytes(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the replication factor fixed at format time, so a node can
    /// resume with the right redundancy policy after a full restart.
    pub fn set_copies(&self, copies: u32) -> Result<()> {
        let mut file = File::create(self.dir.join(COPIES_FILE))?;
        file.write_all(&copies.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// The recorded replication factor, 0 when unset.
    pub fn copies(&self) -> Result<u32> {
        let mut data = [0u8; 4];
        match File::open(self.dir.join(COPIES_FILE)) {
            Ok(mut f) => {
                f.read_exact(&mut data)?;
                Ok(u32::from_le_bytes(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::net::IpAddr;

    fn node(ip: &str, port: u16) -> Node {
        Node::new(NodeId::new(ip.parse::<IpAddr>().unwrap(), port), 1, 64)
    }

    #[test]
    fn test_append_read_latest() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        assert_eq!(log.latest().unwrap(), 0);

        let members = vec![node("10.0.0.1", 7000)];
        log.append(1, &members).unwrap();
        let mut members2 = members.clone();
        members2.push(node("10.0.0.2", 7000));
        log.append(2, &members2).unwrap();

        assert_eq!(log.latest().unwrap(), 2);
        assert_eq!(log.read(1).unwrap(), members);
        assert_eq!(log.read(2).unwrap(), members2);
        assert!(matches!(log.read(3), Err(Error::InvalidEpoch(3))));
    }

    #[test]
    fn test_torn_entry_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("epoch").join("00000005"), [0u8; 17]).unwrap();
        assert!(matches!(log.read(5), Err(Error::InvalidEpoch(5))));
    }

    #[test]
    fn test_ctime_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        assert_eq!(log.ctime().unwrap(), 0);
        log.set_ctime(1_700_000_000).unwrap();
        log.set_ctime(1_700_000_000).unwrap();
        assert!(matches!(log.set_ctime(42), Err(Error::InvalidCtime)));
        assert_eq!(log.ctime().unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        log.append(1, &[node("10.0.0.1", 7000)]).unwrap();
        log.remove(1).unwrap();
        log.remove(1).unwrap();
        assert_eq!(log.latest().unwrap(), 0);
    }
}
