//! Gateway fan-out.
//!
//! Any node can accept a client object op; this module turns it into the
//! multi-replica operation the placement rules demand. Writes go to every
//! owner and succeed only when enough replicas ack (per the configured
//! policy); reads walk the owners in ring order and take the first copy
//! that answers.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use corelib::{ClusterView, Error, NodeId, Result, SharedView, Status, WritePolicy, DATA_OBJ_SIZE};
use tokio::task::JoinSet;
use transport::proto::{flag, op, SdReq};
use transport::PeerClient;

use crate::local::LocalOps;

/// How long the entry node waits for its membership view to catch up after
/// a replica reported an epoch mismatch, before the single retry.
const EPOCH_RETRY_DELAY: Duration = Duration::from_millis(100);

fn quorum(copies: usize) -> usize {
    copies / 2 + 1
}

#[derive(Clone)]
pub struct Gateway {
    node: NodeId,
    view: SharedView,
    local: LocalOps,
    client: PeerClient,
    policy: WritePolicy,
}

impl Gateway {
    pub fn new(
        node: NodeId,
        view: SharedView,
        local: LocalOps,
        client: PeerClient,
        policy: WritePolicy,
    ) -> Self {
        Self {
            node,
            view,
            local,
            client,
            policy,
        }
    }

    /// Owner set for a write, degraded to what the ring can provide when
    /// the policy allows it.
    fn write_owners(&self, view: &ClusterView, oid: u64) -> Result<Vec<NodeId>> {
        match view.ring.owners(oid, view.copies) {
            Ok(owners) => Ok(owners),
            Err(_) => match self.policy {
                WritePolicy::Halt => Err(Error::Halt),
                WritePolicy::Degraded => {
                    let owners = view.ring.owners_at_most(oid, view.copies);
                    if owners.len() >= quorum(view.copies) {
                        Ok(owners)
                    } else {
                        Err(Error::Halt)
                    }
                }
            },
        }
    }

    /// One leg of a fan-out: local execution when this node is the owner,
    /// a pooled peer call otherwise.
    async fn call_one(&self, owner: NodeId, req: &SdReq, data: &Bytes) -> Result<Bytes> {
        if owner == self.node {
            self.local.exec(req, data.clone()).await
        } else {
            self.client.call_ok(owner, req, data).await
        }
    }

    /// Replicated write of `data` at `offset` into `oid`.
    ///
    /// A copy-on-write create (`cow_oid != 0`) materializes the full object
    /// from the backing copy first, so every replica receives identical
    /// contents in one frame.
    pub async fn write_obj(
        &self,
        oid: u64,
        offset: u32,
        data: Bytes,
        create: bool,
        cow_oid: u64,
    ) -> Result<()> {
        let (payload, offset) = if create && cow_oid != 0 {
            let base = self.read_obj(cow_oid, 0, DATA_OBJ_SIZE as u32).await?;
            let mut full = BytesMut::from(&base[..]);
            let end = offset as usize + data.len();
            if full.len() < end {
                full.resize(end, 0);
            }
            full[offset as usize..end].copy_from_slice(&data);
            (full.freeze(), 0u32)
        } else {
            (data, offset)
        };

        let opcode = if create {
            op::CREATE_AND_WRITE_OBJ
        } else {
            op::WRITE_OBJ
        };
        self.fan_out_write(opcode, oid, offset, payload).await
    }

    /// Replicated removal of `oid`. A replica that already lost the object
    /// counts as acked.
    pub async fn remove_obj(&self, oid: u64) -> Result<()> {
        self.fan_out_write(op::REMOVE_OBJ, oid, 0, Bytes::new()).await
    }

    async fn fan_out_write(&self, opcode: u8, oid: u64, offset: u32, payload: Bytes) -> Result<()> {
        let mut refreshed = false;
        loop {
            let view = self.view.get();
            if view.status == Status::Halted {
                return Err(Error::Halt);
            }
            let owners = self.write_owners(&view, oid)?;

            let mut req = SdReq::new(opcode);
            req.flags = flag::WRITE | flag::IO_LOCAL;
            req.epoch = view.epoch;
            req.data_length = payload.len() as u32;
            {
                let hdr = req.obj_mut();
                hdr.oid = oid;
                hdr.copies = view.copies as u32;
                hdr.offset = offset;
            }

            let mut set = JoinSet::new();
            for owner in owners.iter().copied() {
                let this = self.clone();
                let req = req.clone();
                let payload = payload.clone();
                set.spawn(async move {
                    let result = this.call_one(owner, &req, &payload).await;
                    (owner, result)
                });
            }

            let mut acked = 0usize;
            let mut epoch_mismatch = false;
            let mut last_err: Option<Error> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(_))) => acked += 1,
                    Ok((_, Err(Error::NoObject))) if opcode == op::REMOVE_OBJ => acked += 1,
                    Ok((owner, Err(e))) => {
                        if e.is_epoch_mismatch() {
                            epoch_mismatch = true;
                        }
                        tracing::warn!(
                            %owner,
                            oid = format_args!("{oid:016x}"),
                            error = %e,
                            "replica write failed"
                        );
                        last_err = Some(e);
                    }
                    Err(e) => last_err = Some(Error::System(e.to_string())),
                }
            }

            if epoch_mismatch {
                if refreshed {
                    return Err(Error::System(
                        "epoch disagreement persists after ring refresh".into(),
                    ));
                }
                refreshed = true;
                tokio::time::sleep(EPOCH_RETRY_DELAY).await;
                continue;
            }

            let needed = match self.policy {
                WritePolicy::Halt => owners.len(),
                WritePolicy::Degraded => quorum(view.copies),
            };
            if acked >= needed {
                return Ok(());
            }
            // Either every replica failed with a request-level error worth
            // surfacing, or the copies diverged and the safe answer is halt.
            return Err(if acked == 0 {
                last_err.unwrap_or(Error::Halt)
            } else {
                Error::Halt
            });
        }
    }

    /// Read `len` bytes at `offset` from any owner of `oid`, in ring order.
    /// While recovery is rebuilding the layout, a miss on the current
    /// owners falls back to the previous ring.
    pub async fn read_obj(&self, oid: u64, offset: u32, len: u32) -> Result<Bytes> {
        let view = self.view.get();
        let copies = view.copies.max(1);

        let mut req = SdReq::new(op::READ_OBJ);
        req.flags = flag::IO_LOCAL;
        req.epoch = view.epoch;
        req.data_length = len;
        {
            let hdr = req.obj_mut();
            hdr.oid = oid;
            hdr.copies = view.copies as u32;
            hdr.offset = offset;
        }

        let mut last_err = Error::NoObject;
        for owner in view.ring.owners_at_most(oid, copies) {
            match self.call_one(owner, &req, &Bytes::new()).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    tracing::debug!(%owner, oid = format_args!("{oid:016x}"), error = %e, "read fallover");
                    last_err = e;
                }
            }
        }

        if let Some(old) = view.prev.as_ref() {
            let mut req = req.clone();
            req.flags |= flag::RECOVERY;
            req.obj_mut().tgt_epoch = old.epoch;
            for owner in old.ring.owners_at_most(oid, copies) {
                match self.call_one(owner, &req, &Bytes::new()).await {
                    Ok(body) => return Ok(body),
                    Err(e) => last_err = e,
                }
            }
        }

        Err(last_err)
    }
}
