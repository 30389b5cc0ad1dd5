//! A thin synchronous-style client over one connection.
//!
//! Used by the end-to-end tests and handy for poking a cluster by hand;
//! production clients speak the same frames from their own codebases.

use std::net::SocketAddr;

use bytes::Bytes;
use corelib::{Error, Node, Result, Status};
use tokio::net::TcpStream;
use transport::proto::{flag, op, RspBody, SdReq, SdRsp};
use transport::request_on;

use crate::server::VdiEntry;

pub struct ClusterClient {
    stream: TcpStream,
    next_id: u32,
}

#[derive(Clone, Debug)]
pub struct ClusterStat {
    pub ctime: u64,
    pub epoch: u32,
    pub status: Option<Status>,
    pub nodes: Vec<Node>,
}

impl ClusterClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, next_id: 1 })
    }

    async fn call(&mut self, mut req: SdReq, data: &[u8]) -> Result<(SdRsp, Bytes)> {
        req.id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if !data.is_empty() {
            req.flags |= flag::WRITE;
            req.data_length = data.len() as u32;
        }
        request_on(&mut self.stream, &req, data).await
    }

    async fn call_ok(&mut self, req: SdReq, data: &[u8]) -> Result<Bytes> {
        let (rsp, body) = self.call(req, data).await?;
        rsp.ok()?;
        Ok(body)
    }

    pub async fn format(&mut self, ctime: u64, copies: u32) -> Result<()> {
        let mut req = SdReq::new(op::MAKE_FS);
        {
            let hdr = req.cluster_mut();
            hdr.ctime = ctime;
            hdr.copies = copies;
        }
        self.call_ok(req, &[]).await.map(|_| ())
    }

    pub async fn create_and_write(&mut self, oid: u64, offset: u32, data: &[u8]) -> Result<()> {
        let mut req = SdReq::new(op::CREATE_AND_WRITE_OBJ);
        req.obj_mut().oid = oid;
        req.obj_mut().offset = offset;
        self.call_ok(req, data).await.map(|_| ())
    }

    pub async fn write(&mut self, oid: u64, offset: u32, data: &[u8]) -> Result<()> {
        let mut req = SdReq::new(op::WRITE_OBJ);
        req.obj_mut().oid = oid;
        req.obj_mut().offset = offset;
        self.call_ok(req, data).await.map(|_| ())
    }

    pub async fn read(&mut self, oid: u64, offset: u32, len: u32) -> Result<Bytes> {
        let mut req = SdReq::new(op::READ_OBJ);
        req.obj_mut().oid = oid;
        req.obj_mut().offset = offset;
        req.data_length = len;
        self.call_ok(req, &[]).await
    }

    pub async fn remove(&mut self, oid: u64) -> Result<()> {
        let mut req = SdReq::new(op::REMOVE_OBJ);
        req.obj_mut().oid = oid;
        self.call_ok(req, &[]).await.map(|_| ())
    }

    pub async fn new_vdi(&mut self, name: &str, size: u64) -> Result<u32> {
        let mut req = SdReq::new(op::NEW_VDI);
        req.vdi_mut().vdi_size = size;
        let (rsp, _) = self.call(req, name.as_bytes()).await?;
        rsp.ok()?;
        match rsp.body {
            RspBody::Vdi { vdi_id, .. } => Ok(vdi_id),
            _ => Err(Error::System("malformed vdi response".into())),
        }
    }

    pub async fn del_vdi(&mut self, name: &str) -> Result<()> {
        let req = SdReq::new(op::DEL_VDI);
        self.call_ok(req, name.as_bytes()).await.map(|_| ())
    }

    pub async fn vdi_info(&mut self, name: &str) -> Result<u32> {
        let req = SdReq::new(op::GET_VDI_INFO);
        let (rsp, _) = self.call(req, name.as_bytes()).await?;
        rsp.ok()?;
        match rsp.body {
            RspBody::Vdi { vdi_id, .. } => Ok(vdi_id),
            _ => Err(Error::System("malformed vdi response".into())),
        }
    }

    pub async fn lock_vdi(&mut self, name: &str) -> Result<()> {
        let req = SdReq::new(op::LOCK_VDI);
        self.call_ok(req, name.as_bytes()).await.map(|_| ())
    }

    pub async fn release_vdi(&mut self, name: &str) -> Result<()> {
        let req = SdReq::new(op::RELEASE_VDI);
        self.call_ok(req, name.as_bytes()).await.map(|_| ())
    }

    pub async fn vdis(&mut self) -> Result<Vec<VdiEntry>> {
        let req = SdReq::new(op::READ_VDIS);
        let body = self.call_ok(req, &[]).await?;
        bincode::deserialize(&body).map_err(|e| Error::System(e.to_string()))
    }

    pub async fn stat(&mut self) -> Result<ClusterStat> {
        let req = SdReq::new(op::STAT_CLUSTER);
        let (rsp, body) = self.call(req, &[]).await?;
        rsp.ok()?;
        let RspBody::Cluster {
            ctime,
            epoch,
            status,
            ..
        } = rsp.body
        else {
            return Err(Error::System("malformed cluster response".into()));
        };
        let mut nodes = Vec::new();
        let mut buf = &body[..];
        while !buf.is_empty() {
            nodes.push(Node::decode(&mut buf)?);
        }
        Ok(ClusterStat {
            ctime,
            epoch,
            status: Status::from_wire(status),
            nodes,
        })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        let req = SdReq::new(op::SHUTDOWN);
        self.call_ok(req, &[]).await.map(|_| ())
    }

    /// Membership snapshot recorded for a specific epoch.
    pub async fn get_epoch(&mut self, epoch: u32) -> Result<Vec<Node>> {
        let mut req = SdReq::new(op::GET_EPOCH);
        req.cluster_mut().epoch = epoch;
        let body = self.call_ok(req, &[]).await?;
        let mut nodes = Vec::new();
        let mut buf = &body[..];
        while !buf.is_empty() {
            nodes.push(Node::decode(&mut buf)?);
        }
        Ok(nodes)
    }
}
