//! Execution of object ops on this replica.
//!
//! Everything here runs for requests flagged `IO_LOCAL`: either a client
//! frame forwarded by some gateway, or the local leg of this node's own
//! fan-out. The epoch gate lives at this boundary so a replica never
//! applies an op computed against a membership it does not share.
//!
//! For reads the header's `data_length` names the requested length, the
//! same convention the response uses for the bytes it carries back.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use corelib::{Error, Result, SharedView, WorkQueues};
use store::ObjectStore;
use transport::proto::{flag, op, SdReq};

#[derive(Clone)]
pub struct LocalOps {
    view: SharedView,
    store: Arc<ObjectStore>,
    queues: Arc<WorkQueues>,
}

impl LocalOps {
    pub fn new(view: SharedView, store: Arc<ObjectStore>, queues: Arc<WorkQueues>) -> Self {
        Self { view, store, queues }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Run one `IO_LOCAL` object op on the disk pool and return the
    /// response payload.
    pub async fn exec(&self, req: &SdReq, data: Bytes) -> Result<Bytes> {
        let view = self.view.get();
        // Recovery traffic is allowed to address an older layout.
        if req.flags & flag::RECOVERY == 0 {
            view.check_epoch(req.epoch)?;
        }
        let hdr = *req.obj()?;
        let opcode = req.opcode;
        let flags = req.flags;
        let len = req.data_length;
        let store = Arc::clone(&self.store);

        self.queues
            .io
            .run(move || -> Result<Bytes> {
                match opcode {
                    op::READ_OBJ => {
                        let out = if flags & flag::RECOVERY != 0 {
                            store.read_stale(hdr.oid, hdr.tgt_epoch, hdr.offset, len)?
                        } else {
                            store.read(hdr.oid, hdr.offset, len)?
                        };
                        Ok(Bytes::from(out))
                    }
                    op::WRITE_OBJ => {
                        store.write(hdr.oid, hdr.offset, &data, false)?;
                        Ok(Bytes::new())
                    }
                    op::CREATE_AND_WRITE_OBJ => {
                        store.write(hdr.oid, hdr.offset, &data, true)?;
                        Ok(Bytes::new())
                    }
                    op::REMOVE_OBJ => {
                        store.remove(hdr.oid)?;
                        Ok(Bytes::new())
                    }
                    op::GET_OBJ_LIST => {
                        // `oid`/`cow_oid` carry the requested hash range;
                        // zeroes ask for everything.
                        let oids = if hdr.oid == 0 && hdr.cow_oid == 0 {
                            store.list()?
                        } else {
                            store.list_range(hdr.oid, hdr.cow_oid)?
                        };
                        let mut buf = BytesMut::with_capacity(oids.len() * 8);
                        for oid in oids {
                            buf.put_u64_le(oid);
                        }
                        Ok(buf.freeze())
                    }
                    other => Err(Error::InvalidParms(format!(
                        "opcode {other:#04x} is not a local object op"
                    ))),
                }
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::{ClusterConfig, ClusterView, Status};

    fn ops() -> (tempfile::TempDir, LocalOps) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(ObjectStore::open(dir.path(), &ClusterConfig::default()).unwrap());
        let queues = Arc::new(WorkQueues::start());
        let mut view = ClusterView::unformatted();
        view.epoch = 3;
        view.status = Status::Serving;
        view.copies = 1;
        (dir, LocalOps::new(SharedView::new(view), store, queues))
    }

    fn obj_req(opcode: u8, oid: u64, epoch: u32) -> SdReq {
        let mut req = SdReq::new(opcode);
        req.flags = flag::IO_LOCAL;
        req.epoch = epoch;
        req.obj_mut().oid = oid;
        req
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (_dir, ops) = ops();
        let mut create = obj_req(op::CREATE_AND_WRITE_OBJ, 0x10, 3);
        create.flags |= flag::WRITE;
        create.data_length = 4;
        ops.exec(&create, Bytes::from_static(b"data")).await.unwrap();

        let mut read = obj_req(op::READ_OBJ, 0x10, 3);
        read.data_length = 4;
        let body = ops.exec(&read, Bytes::new()).await.unwrap();
        assert_eq!(&body[..], b"data");
    }

    #[tokio::test]
    async fn test_epoch_gate() {
        let (_dir, ops) = ops();
        let read = obj_req(op::READ_OBJ, 0x10, 2);
        assert!(matches!(
            ops.exec(&read, Bytes::new()).await,
            Err(Error::OldNodeVer)
        ));
        let read = obj_req(op::READ_OBJ, 0x10, 4);
        assert!(matches!(
            ops.exec(&read, Bytes::new()).await,
            Err(Error::NewNodeVer)
        ));
    }

    #[tokio::test]
    async fn test_recovery_flag_bypasses_gate_and_reads_stale() {
        let (_dir, ops) = ops();
        let mut create = obj_req(op::CREATE_AND_WRITE_OBJ, 0x20, 3);
        create.flags |= flag::WRITE;
        create.data_length = 3;
        ops.exec(&create, Bytes::from_static(b"old")).await.unwrap();
        ops.store().mark_stale(0x20, 2).unwrap();

        let mut read = obj_req(op::READ_OBJ, 0x20, 9);
        read.flags |= flag::RECOVERY;
        read.data_length = 3;
        read.obj_mut().tgt_epoch = 2;
        let body = ops.exec(&read, Bytes::new()).await.unwrap();
        assert_eq!(&body[..], b"old");
    }

    #[tokio::test]
    async fn test_object_list_transfer() {
        let (_dir, ops) = ops();
        for oid in [1u64, 2, 3] {
            let mut create = obj_req(op::CREATE_AND_WRITE_OBJ, oid, 3);
            create.flags |= flag::WRITE;
            create.data_length = 1;
            ops.exec(&create, Bytes::from_static(b"x")).await.unwrap();
        }
        let req = obj_req(op::GET_OBJ_LIST, 0, 3);
        let mut body = ops.exec(&req, Bytes::new()).await.unwrap();
        let mut oids = Vec::new();
        use bytes::Buf;
        while body.remaining() >= 8 {
            oids.push(body.get_u64_le());
        }
        assert_eq!(oids, vec![1, 2, 3]);
    }
}
