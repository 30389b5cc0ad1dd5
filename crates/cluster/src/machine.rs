//! The membership state machine.
//!
//! One task owns all cluster-wide state transitions. It consumes the
//! totally-ordered driver events (joins, leaves, vdi ops) and commands from
//! the connection layer, persists each new epoch snapshot before swapping
//! the shared view, and kicks recovery whenever the ring changed under live
//! objects. Nothing else writes the view or the vdi registry.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use corelib::{
    ClusterView, EpochLog, Error, Node, NodeId, OldRing, Result, Ring, SharedView, Status,
    WorkQueues, MAX_COPIES,
};
use parking_lot::RwLock;
use replication::Gateway;
use store::vdi::{inode_oid, is_inode_oid, oid_vdi_id};
use store::{ObjectStore, VdiInode};
use tokio::sync::{mpsc, oneshot};
use transport::PeerClient;

use crate::driver::{ClusterDriver, DriverEvent};
use crate::message::{
    ClusterMessage, JoinReject, JoinRequest, JoinResponse, JoinVerdict, VdiOp, VdiOpMessage,
};
use crate::recovery::{self, RecoveryCtx};
use crate::vdi::{VdiRegistry, VdiState};

type Reply = oneshot::Sender<Result<u32>>;

/// Requests from the connection layer into the state machine.
pub enum Command {
    Format {
        ctime: u64,
        copies: u32,
        reply: Reply,
    },
    NewVdi {
        name: String,
        size: u64,
        base_vdi_id: u32,
        snap_id: u32,
        ctime: u64,
        reply: Reply,
    },
    DelVdi {
        name: String,
        reply: Reply,
    },
    LockVdi {
        name: String,
        owner: NodeId,
        reply: Reply,
    },
    ReleaseVdi {
        name: String,
        owner: NodeId,
        reply: Reply,
    },
    Shutdown {
        reply: Reply,
    },
    /// Internal: the recovery task for `epoch` completed.
    RecoveryDone {
        epoch: u32,
    },
}

/// Cheap handle used by request dispatch to talk to the machine.
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClusterHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn format(&self, ctime: u64, copies: u32) -> Result<()> {
        self.request(|reply| Command::Format { ctime, copies, reply })
            .await
            .map(|_| ())
    }

    pub async fn new_vdi(
        &self,
        name: String,
        size: u64,
        base_vdi_id: u32,
        snap_id: u32,
        ctime: u64,
    ) -> Result<u32> {
        self.request(|reply| Command::NewVdi {
            name,
            size,
            base_vdi_id,
            snap_id,
            ctime,
            reply,
        })
        .await
    }

    pub async fn del_vdi(&self, name: String) -> Result<u32> {
        self.request(|reply| Command::DelVdi { name, reply }).await
    }

    pub async fn lock_vdi(&self, name: String, owner: NodeId) -> Result<()> {
        self.request(|reply| Command::LockVdi { name, owner, reply })
            .await
            .map(|_| ())
    }

    pub async fn release_vdi(&self, name: String, owner: NodeId) -> Result<()> {
        self.request(|reply| Command::ReleaseVdi { name, owner, reply })
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply })
            .await
            .map(|_| ())
    }

    fn recovery_done(&self, epoch: u32) {
        let _ = self.tx.send(Command::RecoveryDone { epoch });
    }
}

pub struct MachineParams {
    pub me: Node,
    pub view: SharedView,
    pub epoch_log: Arc<EpochLog>,
    pub registry: Arc<RwLock<VdiRegistry>>,
    pub store: Arc<ObjectStore>,
    pub queues: Arc<WorkQueues>,
    pub gateway: Gateway,
    pub client: PeerClient,
    pub driver: Arc<dyn ClusterDriver>,
}

/// Boot the state machine: rebuild the registry from local inodes, set the
/// initial status from the epoch log, announce the join, and start the
/// event loop.
pub fn spawn(params: MachineParams) -> Result<ClusterHandle> {
    let local_epoch = params.epoch_log.latest()?;
    let local_ctime = params.epoch_log.ctime()?;

    rebuild_registry(&params.store, &params.registry)?;

    let mut boot_view = ClusterView::unformatted();
    boot_view.status = if local_epoch == 0 {
        Status::WaitForFormat
    } else {
        Status::WaitForJoin
    };
    params.view.set(boot_view);

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ClusterHandle { tx };
    let machine = Machine {
        me: params.me,
        view: params.view,
        epoch_log: params.epoch_log,
        registry: params.registry,
        store: params.store,
        queues: params.queues,
        gateway: params.gateway,
        client: params.client,
        driver: params.driver,
        handle: handle.clone(),
        members: Vec::new(),
        accepted: Vec::new(),
        local_epoch,
        local_ctime,
        next_seq: 1,
        pending: HashMap::new(),
        shutdown_reply: None,
    };
    tokio::spawn(machine.run(rx));
    Ok(handle)
}

/// Seed the registry from inode objects already on disk, so vdi lookups
/// survive a whole-cluster restart.
fn rebuild_registry(store: &Arc<ObjectStore>, registry: &Arc<RwLock<VdiRegistry>>) -> Result<()> {
    let mut reg = registry.write();
    for oid in store.list()?.into_iter().filter(|o| is_inode_oid(*o)) {
        let data = match store.read(oid, 0, u32::MAX) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(oid = format_args!("{oid:016x}"), error = %e, "unreadable inode");
                continue;
            }
        };
        match VdiInode::decode(&data) {
            Ok(inode) => {
                reg.seed(
                    &inode.name.clone(),
                    VdiState {
                        vdi_id: inode.vdi_id,
                        size: inode.size,
                        ctime: inode.ctime,
                        parent_vdi_id: inode.parent_vdi_id,
                        snap_id: inode.snap_id,
                        copies: inode.copies,
                        locked_by: None,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(oid = format_args!("{oid:016x}"), error = %e, "undecodable inode");
            }
        }
    }
    Ok(())
}

struct Machine {
    me: Node,
    view: SharedView,
    epoch_log: Arc<EpochLog>,
    registry: Arc<RwLock<VdiRegistry>>,
    store: Arc<ObjectStore>,
    queues: Arc<WorkQueues>,
    gateway: Gateway,
    client: PeerClient,
    driver: Arc<dyn ClusterDriver>,
    handle: ClusterHandle,
    /// Raw bus membership, including joiners not yet accepted.
    members: Vec<Node>,
    /// Members whose join the master accepted; the ring is built from
    /// exactly this list.
    accepted: Vec<Node>,
    local_epoch: u32,
    local_ctime: u64,
    next_seq: u64,
    pending: HashMap<u64, Reply>,
    shutdown_reply: Option<Reply>,
}

impl Machine {
    async fn run(mut self, mut cmds: mpsc::UnboundedReceiver<Command>) {
        let mut events = self.driver.subscribe();

        let announce = ClusterMessage::Join(JoinRequest {
            node: self.me,
            epoch: self.local_epoch,
            ctime: self.local_ctime,
        });
        match announce.encode() {
            Ok(payload) => {
                if let Err(e) = self.driver.join(self.me, payload).await {
                    tracing::error!(error = %e, "failed to join the cluster bus");
                    self.view.set_status(Status::Killed);
                    return;
                }
                if self.local_epoch > 0 {
                    self.view.set_status(Status::Joining);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode join request");
                self.view.set_status(Status::Killed);
                return;
            }
        }

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                maybe_cmd = cmds.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }
        tracing::debug!("cluster state machine stopped");
    }

    // ---- driver events -------------------------------------------------

    async fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::ConfChange { left, members, .. } => {
                self.members = members;
                if !left.is_empty() {
                    self.handle_left(left).await;
                }
            }
            DriverEvent::Message { from, data } => match ClusterMessage::decode(&data) {
                Ok(msg) => self.handle_message(from, msg).await,
                Err(e) => tracing::warn!(%from, error = %e, "undecodable cluster message"),
            },
        }
    }

    async fn handle_message(&mut self, from: NodeId, msg: ClusterMessage) {
        match msg {
            ClusterMessage::Join(join) => self.handle_join(join).await,
            ClusterMessage::JoinResponse(rsp) => self.handle_join_response(rsp).await,
            ClusterMessage::VdiOp(op) => self.apply_vdi_op(op),
            ClusterMessage::MasterChanged { master } => {
                tracing::info!(%master, "master changed");
            }
            ClusterMessage::Shutdown => {
                tracing::info!(%from, "cluster shutdown requested");
                self.view.set_status(Status::ShuttingDown);
                if let Some(reply) = self.shutdown_reply.take() {
                    let _ = reply.send(Ok(0));
                }
            }
        }
    }

    /// The node answering a join is the lowest-ranked member that was
    /// already in the group; the very first node answers itself.
    fn join_acceptor(&self, joiner: NodeId) -> Option<NodeId> {
        self.members
            .iter()
            .map(|n| n.nid)
            .filter(|nid| *nid != joiner)
            .min()
            .or(Some(joiner))
    }

    async fn handle_join(&mut self, join: JoinRequest) {
        if self.join_acceptor(join.node.nid) != Some(self.me.nid) {
            return;
        }
        let verdict = match self.validate_join(&join) {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(error = %e, "join validation failed");
                return;
            }
        };
        let response = ClusterMessage::JoinResponse(JoinResponse {
            node: join.node,
            verdict,
        });
        match response.encode() {
            Ok(payload) => {
                if let Err(e) = self.driver.notify(payload).await {
                    tracing::error!(error = %e, "failed to broadcast join response");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode join response"),
        }
    }

    fn validate_join(&self, join: &JoinRequest) -> Result<JoinVerdict> {
        let cluster_ctime = self.epoch_log.ctime()?;
        let cluster_copies = self.epoch_log.copies()?;
        let cluster_epoch = self.view.get().epoch.max(self.epoch_log.latest()?);

        if cluster_ctime != 0 && join.ctime != 0 && join.ctime != cluster_ctime {
            tracing::warn!(node = %join.node, "join rejected: creation times differ");
            return Ok(JoinVerdict::Reject(JoinReject::InvalidCtime));
        }
        if join.epoch > cluster_epoch {
            tracing::warn!(
                node = %join.node,
                joiner_epoch = join.epoch,
                cluster_epoch,
                "join rejected: joiner is ahead"
            );
            return Ok(JoinVerdict::Reject(JoinReject::NewNodeVer));
        }

        let mut members = self.accepted.clone();
        if !members.iter().any(|m| m.nid == join.node.nid) {
            members.push(join.node);
        }
        let mut replay = Vec::new();
        for epoch in join.epoch + 1..=cluster_epoch {
            replay.push((epoch, self.epoch_log.read(epoch)?));
        }
        Ok(JoinVerdict::Accept {
            ctime: cluster_ctime,
            copies: cluster_copies,
            members,
            replay,
            vdis: self.registry.read().export(),
        })
    }

    async fn handle_join_response(&mut self, rsp: JoinResponse) {
        let joiner = rsp.node;
        match rsp.verdict {
            JoinVerdict::Reject(reason) => {
                if joiner.nid == self.me.nid {
                    tracing::error!(error = %reason.into_error(), "join rejected, exiting");
                    self.view.set_status(Status::Killed);
                }
            }
            JoinVerdict::Accept {
                ctime,
                copies,
                members,
                replay,
                vdis,
            } => {
                if joiner.nid == self.me.nid {
                    if let Err(e) = self.persist_replay(ctime, copies, &replay) {
                        tracing::error!(error = %e, "failed to persist replayed epochs");
                        self.view.set_status(Status::Killed);
                        return;
                    }
                    self.registry.write().import(vdis);
                }
                self.accepted = members;
                if copies == 0 {
                    // Cluster not formatted yet; everyone keeps waiting,
                    // but the member list is reflected so operators can
                    // watch the group assemble.
                    let mut pre = (*self.view.get()).clone();
                    pre.ring = Ring::build(&self.accepted);
                    if joiner.nid == self.me.nid {
                        pre.status = Status::WaitForFormat;
                    }
                    self.view.set(pre);
                    return;
                }
                let old_epoch = self.view.get().epoch.max(self.epoch_log.latest().unwrap_or(0));
                self.advance_epoch(old_epoch + 1, ctime, copies);
            }
        }
    }

    fn persist_replay(&mut self, ctime: u64, copies: u32, replay: &[(u32, Vec<Node>)]) -> Result<()> {
        if ctime != 0 {
            self.epoch_log.set_ctime(ctime)?;
            self.local_ctime = ctime;
        }
        if copies != 0 {
            self.epoch_log.set_copies(copies)?;
        }
        for (epoch, nodes) in replay {
            self.epoch_log.append(*epoch, nodes)?;
            self.local_epoch = self.local_epoch.max(*epoch);
        }
        Ok(())
    }

    async fn handle_left(&mut self, left: Vec<Node>) {
        let mut ring_changed = false;
        {
            let mut reg = self.registry.write();
            for node in &left {
                reg.release_all(node.nid);
            }
        }
        for node in &left {
            if let Some(pos) = self.accepted.iter().position(|m| m.nid == node.nid) {
                self.accepted.remove(pos);
                ring_changed = true;
            }
            tracing::info!(node = %node, "member left");
            self.client.pool().invalidate(node.nid);
        }

        let view = self.view.get();
        if view.epoch == 0 || !ring_changed {
            return;
        }
        if self.accepted.is_empty() || !self.accepted.iter().any(|m| m.nid == self.me.nid) {
            return;
        }
        // Surviving members advance the epoch and reshuffle.
        let copies = self.epoch_log.copies().unwrap_or(view.copies as u32);
        self.advance_epoch(view.epoch + 1, view.ctime, copies);

        if self.view.get().master().map(|m| m.nid) == Some(self.me.nid) {
            let msg = ClusterMessage::MasterChanged { master: self.me.nid };
            if let Ok(payload) = msg.encode() {
                let _ = self.driver.notify(payload).await;
            }
        }
    }

    /// Append the snapshot for `epoch`, swap the view, and start recovery
    /// when a previous layout exists. Append happens-before the swap; a
    /// node that cannot persist the epoch stops serving.
    fn advance_epoch(&mut self, epoch: u32, ctime: u64, copies: u32) {
        let nodes = self.accepted.clone();
        if let Err(e) = self.epoch_log.append(epoch, &nodes) {
            tracing::error!(epoch, error = %e, "failed to persist epoch, stopping");
            self.view.set_status(Status::Killed);
            return;
        }
        self.local_epoch = epoch;

        let old_view = self.view.get();
        // A joiner has no in-memory previous ring; the replayed epoch log
        // supplies it so the node pulls what it now owns.
        let prev = if old_view.epoch > 0 {
            Some(OldRing {
                epoch: old_view.epoch,
                ring: old_view.ring.clone(),
            })
        } else if epoch > 1 {
            match self.epoch_log.read(epoch - 1) {
                Ok(prev_nodes) => Some(OldRing {
                    epoch: epoch - 1,
                    ring: Ring::build(&prev_nodes),
                }),
                Err(_) => None,
            }
        } else {
            None
        };

        let ring = Ring::build(&nodes);
        let status = if old_view.status == Status::ShuttingDown {
            Status::ShuttingDown
        } else if redundancy_met(&ring, copies) {
            Status::Serving
        } else {
            Status::Halted
        };
        let recovering = prev.is_some();
        tracing::info!(
            epoch,
            nr_nodes = nodes.len(),
            ?status,
            recovering,
            "epoch advanced"
        );
        self.view.set(ClusterView {
            epoch,
            ctime,
            status,
            copies: copies as usize,
            ring,
            prev,
        });

        if recovering {
            let ctx = RecoveryCtx {
                me: self.me.nid,
                view: self.view.clone(),
                store: Arc::clone(&self.store),
                queues: Arc::clone(&self.queues),
                client: self.client.clone(),
            };
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = recovery::run(ctx).await {
                    tracing::error!(error = %e, "recovery pass failed");
                }
                handle.recovery_done(epoch);
            });
        }
    }

    // ---- ordered vdi ops ----------------------------------------------

    fn apply_vdi_op(&mut self, msg: VdiOpMessage) {
        let mine = msg.origin == self.me.nid;
        let reply = mine.then(|| self.pending.remove(&msg.seq)).flatten();

        match msg.op {
            VdiOp::Format { ctime, copies } => {
                let result = self.apply_format(ctime, copies);
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(|_| 0));
                }
            }
            VdiOp::Create {
                name,
                size,
                base_vdi_id,
                snap_id,
                ctime,
            } => {
                let result = {
                    let view = self.view.get();
                    self.registry.write().create(
                        &name,
                        size,
                        ctime,
                        base_vdi_id,
                        snap_id,
                        view.copies as u32,
                    )
                };
                match result {
                    Ok(state) => {
                        tracing::info!(
                            %name,
                            vdi_id = format_args!("{:06x}", state.vdi_id),
                            "vdi created"
                        );
                        if let Some(reply) = reply {
                            self.write_inode(name, state, reply);
                        }
                    }
                    Err(e) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            VdiOp::Delete { name } => {
                let result = self.registry.write().delete(&name);
                match result {
                    Ok(state) => {
                        tracing::info!(%name, "vdi deleted");
                        self.sweep_vdi(state.vdi_id);
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(state.vdi_id));
                        }
                    }
                    Err(e) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            VdiOp::Lock { name, owner } => {
                let result = self.registry.write().lock(&name, owner);
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(|_| 0));
                }
            }
            VdiOp::Release { name, owner } => {
                let result = self.registry.write().release(&name, owner);
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(|_| 0));
                }
            }
        }
    }

    fn apply_format(&mut self, ctime: u64, copies: u32) -> Result<()> {
        if self.view.get().epoch != 0 {
            return Err(Error::InvalidParms("cluster is already formatted".into()));
        }
        if copies == 0 || copies as usize > MAX_COPIES {
            return Err(Error::InvalidParms(format!(
                "replication factor {copies} out of range"
            )));
        }
        self.epoch_log.set_ctime(ctime)?;
        self.epoch_log.set_copies(copies)?;
        self.local_ctime = ctime;
        tracing::info!(ctime, copies, "cluster formatted");
        self.advance_epoch(1, ctime, copies);
        Ok(())
    }

    /// Origin-side follow-up of a vdi create: replicate the inode object,
    /// then answer the client.
    fn write_inode(&self, name: String, state: VdiState, reply: Reply) {
        let inode = match VdiInode::new(
            name,
            state.vdi_id,
            state.size,
            state.ctime,
            state.parent_vdi_id,
            state.snap_id,
            state.copies,
        ) {
            Ok(inode) => inode,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let result = async {
                let data = inode.encode()?;
                gateway
                    .write_obj(inode_oid(inode.vdi_id), 0, Bytes::from(data), true, 0)
                    .await
            }
            .await;
            let _ = reply.send(result.map(|_| inode.vdi_id));
        });
    }

    /// Unlink every local object belonging to a deleted vdi. Runs on the
    /// deletion queue on every member, which covers all replicas.
    fn sweep_vdi(&self, vdi_id: u32) {
        let store = Arc::clone(&self.store);
        drop(self.queues.deletion.queue(move || {
            let oids = match store.list() {
                Ok(oids) => oids,
                Err(e) => {
                    tracing::warn!(error = %e, "deletion sweep could not list objects");
                    return;
                }
            };
            let mut removed = 0usize;
            for oid in oids.into_iter().filter(|o| oid_vdi_id(*o) == vdi_id) {
                if store.remove(oid).is_ok() {
                    removed += 1;
                }
            }
            tracing::debug!(vdi_id = format_args!("{vdi_id:06x}"), removed, "deletion sweep done");
        }));
    }

    // ---- commands from the connection layer ----------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Format { ctime, copies, reply } => {
                if !self.is_accepted() {
                    // Joins are still in flight; formatting from a view
                    // that predates them would diverge.
                    let _ = reply.send(Err(Error::Startup));
                    return;
                }
                if self.view.get().epoch != 0 {
                    let _ = reply.send(Err(Error::InvalidParms(
                        "cluster is already formatted".into(),
                    )));
                    return;
                }
                self.propose(VdiOp::Format { ctime, copies }, reply).await;
            }
            Command::NewVdi {
                name,
                size,
                base_vdi_id,
                snap_id,
                ctime,
                reply,
            } => {
                if !self.is_formatted() {
                    let _ = reply.send(Err(Error::NotFormatted));
                    return;
                }
                self.propose(
                    VdiOp::Create {
                        name,
                        size,
                        base_vdi_id,
                        snap_id,
                        ctime,
                    },
                    reply,
                )
                .await;
            }
            Command::DelVdi { name, reply } => {
                if !self.is_formatted() {
                    let _ = reply.send(Err(Error::NotFormatted));
                    return;
                }
                self.propose(VdiOp::Delete { name }, reply).await;
            }
            Command::LockVdi { name, owner, reply } => {
                if !self.is_formatted() {
                    let _ = reply.send(Err(Error::NotFormatted));
                    return;
                }
                self.propose(VdiOp::Lock { name, owner }, reply).await;
            }
            Command::ReleaseVdi { name, owner, reply } => {
                if !self.is_formatted() {
                    let _ = reply.send(Err(Error::NotFormatted));
                    return;
                }
                self.propose(VdiOp::Release { name, owner }, reply).await;
            }
            Command::Shutdown { reply } => {
                match ClusterMessage::Shutdown.encode() {
                    Ok(payload) => {
                        self.shutdown_reply = Some(reply);
                        if let Err(e) = self.driver.notify(payload).await {
                            if let Some(reply) = self.shutdown_reply.take() {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::RecoveryDone { epoch } => {
                let view = self.view.get();
                if view.epoch == epoch && view.prev.is_some() {
                    let mut cleared = (*view).clone();
                    cleared.prev = None;
                    self.view.set(cleared);
                    tracing::info!(epoch, "layout converged");
                }
            }
        }
    }

    fn is_formatted(&self) -> bool {
        self.view.get().epoch != 0
    }

    fn is_accepted(&self) -> bool {
        self.accepted.iter().any(|m| m.nid == self.me.nid)
    }

    /// Broadcast an ordered vdi op, remembering the reply until our own
    /// delivery applies it.
    async fn propose(&mut self, op: VdiOp, reply: Reply) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = ClusterMessage::VdiOp(VdiOpMessage {
            origin: self.me.nid,
            seq,
            op,
        });
        match msg.encode() {
            Ok(payload) => {
                self.pending.insert(seq, reply);
                if let Err(e) = self.driver.notify(payload).await {
                    if let Some(reply) = self.pending.remove(&seq) {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }
}

fn redundancy_met(ring: &Ring, copies: u32) -> bool {
    let storage_nodes = ring.nodes().iter().filter(|n| n.nr_vnodes > 0).count();
    storage_nodes >= copies as usize && ring.zone_count() >= copies as usize
}
