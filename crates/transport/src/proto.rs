//! The wire protocol.
//!
//! Every frame is a fixed 48-byte little-endian header followed by
//! `data_length` payload bytes. The last 32 header bytes (28 in responses,
//! after the result word) are an opcode-specific area; which layout applies
//! is decided by the opcode alone, so decoding needs no negotiation.

use bytes::{Buf, BufMut, BytesMut};
use corelib::{Error, Result, DATA_OBJ_SIZE};

pub const PROTO_VER: u8 = 0x01;
pub const HEADER_SIZE: usize = 48;

/// Hard cap on a frame body. Object payloads dominate; everything else is
/// far smaller.
pub const MAX_DATA_LEN: u32 = (DATA_OBJ_SIZE as u32) + 4096;

/// Request opcodes. Client-visible ops live below 0x80, node-to-node ops
/// above.
pub mod op {
    pub const CREATE_AND_WRITE_OBJ: u8 = 0x01;
    pub const READ_OBJ: u8 = 0x02;
    pub const WRITE_OBJ: u8 = 0x03;
    pub const REMOVE_OBJ: u8 = 0x04;

    pub const NEW_VDI: u8 = 0x11;
    pub const DEL_VDI: u8 = 0x12;
    pub const GET_VDI_INFO: u8 = 0x13;
    pub const LOCK_VDI: u8 = 0x14;
    pub const RELEASE_VDI: u8 = 0x15;
    pub const READ_VDIS: u8 = 0x16;
    pub const STAT_CLUSTER: u8 = 0x17;
    pub const MAKE_FS: u8 = 0x18;
    pub const SHUTDOWN: u8 = 0x19;

    pub const GET_OBJ_LIST: u8 = 0x81;
    pub const GET_EPOCH: u8 = 0x82;
}

pub mod flag {
    /// The request carries payload toward the server.
    pub const WRITE: u16 = 0x01;
    /// Execute on this replica; do not fan out again.
    pub const IO_LOCAL: u16 = 0x02;
    /// Recovery traffic: epoch gate is bypassed and stale copies at
    /// `tgt_epoch` are eligible.
    pub const RECOVERY: u16 = 0x04;
    /// The writer accepts cached (non-fsynced) completion.
    pub const CACHE: u16 = 0x08;
}

/// Wire result codes.
pub mod res {
    pub const SUCCESS: u32 = 0;
    pub const UNKNOWN: u32 = 1;
    pub const NO_OBJ: u32 = 2;
    pub const EIO: u32 = 3;
    pub const VDI_EXIST: u32 = 4;
    pub const INVALID_PARMS: u32 = 5;
    pub const SYSTEM_ERROR: u32 = 6;
    pub const VDI_LOCKED: u32 = 7;
    pub const NO_VDI: u32 = 8;
    pub const NO_TAG: u32 = 9;
    pub const STARTUP: u32 = 10;
    pub const NO_MEM: u32 = 11;
    pub const SHUTDOWN: u32 = 12;
    pub const FULL_VDI: u32 = 13;
    pub const VER_MISMATCH: u32 = 14;
    pub const NO_SPACE: u32 = 15;
    pub const WAIT_FOR_FORMAT: u32 = 16;
    pub const WAIT_FOR_JOIN: u32 = 17;
    pub const JOIN_FAILED: u32 = 18;
    pub const HALT: u32 = 19;
    pub const OLD_NODE_VER: u32 = 20;
    pub const NEW_NODE_VER: u32 = 21;
    pub const NOT_FORMATTED: u32 = 22;
    pub const INVALID_CTIME: u32 = 23;
    pub const INVALID_EPOCH: u32 = 24;
}

/// Opcode-specific request area for object I/O.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjReq {
    pub oid: u64,
    /// Copy-on-write source for first writes on a snapshot, 0 when unused.
    pub cow_oid: u64,
    pub copies: u32,
    /// Epoch whose layout the source should answer for (recovery reads,
    /// object list transfers).
    pub tgt_epoch: u32,
    pub offset: u32,
}

/// Opcode-specific request area for vdi operations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VdiReq {
    pub vdi_size: u64,
    pub base_vdi_id: u32,
    pub copies: u32,
    pub snap_id: u32,
}

/// Opcode-specific request area for cluster operations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterReq {
    pub ctime: u64,
    pub copies: u32,
    /// Specific epoch asked for by `GET_EPOCH`.
    pub epoch: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReqBody {
    Obj(ObjReq),
    Vdi(VdiReq),
    Cluster(ClusterReq),
    None,
}

#[derive(Clone, Debug)]
pub struct SdReq {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub body: ReqBody,
}

impl SdReq {
    pub fn new(opcode: u8) -> Self {
        let body = match body_kind(opcode) {
            BodyKind::Obj => ReqBody::Obj(ObjReq::default()),
            BodyKind::Vdi => ReqBody::Vdi(VdiReq::default()),
            BodyKind::Cluster => ReqBody::Cluster(ClusterReq::default()),
            BodyKind::None => ReqBody::None,
        };
        Self {
            proto_ver: PROTO_VER,
            opcode,
            flags: 0,
            epoch: 0,
            id: 0,
            data_length: 0,
            body,
        }
    }

    pub fn obj(&self) -> Result<&ObjReq> {
        match &self.body {
            ReqBody::Obj(o) => Ok(o),
            _ => Err(Error::InvalidParms("object header expected".into())),
        }
    }

    pub fn obj_mut(&mut self) -> &mut ObjReq {
        if !matches!(self.body, ReqBody::Obj(_)) {
            self.body = ReqBody::Obj(ObjReq::default());
        }
        match &mut self.body {
            ReqBody::Obj(o) => o,
            _ => unreachable!(),
        }
    }

    pub fn vdi(&self) -> Result<&VdiReq> {
        match &self.body {
            ReqBody::Vdi(v) => Ok(v),
            _ => Err(Error::InvalidParms("vdi header expected".into())),
        }
    }

    pub fn vdi_mut(&mut self) -> &mut VdiReq {
        if !matches!(self.body, ReqBody::Vdi(_)) {
            self.body = ReqBody::Vdi(VdiReq::default());
        }
        match &mut self.body {
            ReqBody::Vdi(v) => v,
            _ => unreachable!(),
        }
    }

    pub fn cluster(&self) -> Result<&ClusterReq> {
        match &self.body {
            ReqBody::Cluster(c) => Ok(c),
            _ => Err(Error::InvalidParms("cluster header expected".into())),
        }
    }

    pub fn cluster_mut(&mut self) -> &mut ClusterReq {
        if !matches!(self.body, ReqBody::Cluster(_)) {
            self.body = ReqBody::Cluster(ClusterReq::default());
        }
        match &mut self.body {
            ReqBody::Cluster(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u8(self.proto_ver);
        buf.put_u8(self.opcode);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.data_length);
        let start = buf.len();
        match &self.body {
            ReqBody::Obj(o) => {
                buf.put_u64_le(o.oid);
                buf.put_u64_le(o.cow_oid);
                buf.put_u32_le(o.copies);
                buf.put_u32_le(o.tgt_epoch);
                buf.put_u32_le(o.offset);
            }
            ReqBody::Vdi(v) => {
                buf.put_u64_le(v.vdi_size);
                buf.put_u32_le(v.base_vdi_id);
                buf.put_u32_le(v.copies);
                buf.put_u32_le(v.snap_id);
            }
            ReqBody::Cluster(c) => {
                buf.put_u64_le(c.ctime);
                buf.put_u32_le(c.copies);
                buf.put_u32_le(c.epoch);
            }
            ReqBody::None => {}
        }
        buf.put_bytes(0, HEADER_SIZE - 16 - (buf.len() - start));
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let proto_ver = buf.get_u8();
        if proto_ver != PROTO_VER {
            return Err(Error::VerMismatch);
        }
        let opcode = buf.get_u8();
        let flags = buf.get_u16_le();
        let epoch = buf.get_u32_le();
        let id = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        if data_length > MAX_DATA_LEN {
            return Err(Error::InvalidParms(format!(
                "frame body of {data_length} bytes exceeds the protocol limit"
            )));
        }
        let body = match body_kind(opcode) {
            BodyKind::Obj => ReqBody::Obj(ObjReq {
                oid: buf.get_u64_le(),
                cow_oid: buf.get_u64_le(),
                copies: buf.get_u32_le(),
                tgt_epoch: buf.get_u32_le(),
                offset: buf.get_u32_le(),
            }),
            BodyKind::Vdi => ReqBody::Vdi(VdiReq {
                vdi_size: buf.get_u64_le(),
                base_vdi_id: buf.get_u32_le(),
                copies: buf.get_u32_le(),
                snap_id: buf.get_u32_le(),
            }),
            BodyKind::Cluster => ReqBody::Cluster(ClusterReq {
                ctime: buf.get_u64_le(),
                copies: buf.get_u32_le(),
                epoch: buf.get_u32_le(),
            }),
            BodyKind::None => ReqBody::None,
        };
        Ok(Self {
            proto_ver,
            opcode,
            flags,
            epoch,
            id,
            data_length,
            body,
        })
    }
}

/// Opcode-specific response area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RspBody {
    Obj {
        copies: u32,
    },
    Vdi {
        vdi_id: u32,
        copies: u32,
    },
    Cluster {
        ctime: u64,
        epoch: u32,
        nr_nodes: u32,
        /// Wire form of the node's status.
        status: u32,
    },
    None,
}

#[derive(Clone, Debug)]
pub struct SdRsp {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub result: u32,
    pub body: RspBody,
}

impl SdRsp {
    /// The response skeleton for `req`, result preset to success.
    pub fn for_req(req: &SdReq) -> Self {
        let body = match body_kind(req.opcode) {
            BodyKind::Obj => RspBody::Obj { copies: 0 },
            BodyKind::Vdi => RspBody::Vdi { vdi_id: 0, copies: 0 },
            BodyKind::Cluster => RspBody::Cluster {
                ctime: 0,
                epoch: 0,
                nr_nodes: 0,
                status: 0,
            },
            BodyKind::None => RspBody::None,
        };
        Self {
            proto_ver: PROTO_VER,
            opcode: req.opcode,
            flags: 0,
            epoch: req.epoch,
            id: req.id,
            data_length: 0,
            result: res::SUCCESS,
            body,
        }
    }

    /// Interpret the result word as a `Result`.
    pub fn ok(&self) -> Result<()> {
        match code_to_error(self.result) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u8(self.proto_ver);
        buf.put_u8(self.opcode);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.result);
        let start = buf.len();
        match &self.body {
            RspBody::Obj { copies } => buf.put_u32_le(*copies),
            RspBody::Vdi { vdi_id, copies } => {
                buf.put_u32_le(*vdi_id);
                buf.put_u32_le(*copies);
            }
            RspBody::Cluster {
                ctime,
                epoch,
                nr_nodes,
                status,
            } => {
                buf.put_u64_le(*ctime);
                buf.put_u32_le(*epoch);
                buf.put_u32_le(*nr_nodes);
                buf.put_u32_le(*status);
            }
            RspBody::None => {}
        }
        buf.put_bytes(0, HEADER_SIZE - 20 - (buf.len() - start));
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let proto_ver = buf.get_u8();
        if proto_ver != PROTO_VER {
            return Err(Error::VerMismatch);
        }
        let opcode = buf.get_u8();
        let flags = buf.get_u16_le();
        let epoch = buf.get_u32_le();
        let id = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        if data_length > MAX_DATA_LEN {
            return Err(Error::InvalidParms(format!(
                "frame body of {data_length} bytes exceeds the protocol limit"
            )));
        }
        let result = buf.get_u32_le();
        let body = match body_kind(opcode) {
            BodyKind::Obj => RspBody::Obj {
                copies: buf.get_u32_le(),
            },
            BodyKind::Vdi => RspBody::Vdi {
                vdi_id: buf.get_u32_le(),
                copies: buf.get_u32_le(),
            },
            BodyKind::Cluster => RspBody::Cluster {
                ctime: buf.get_u64_le(),
                epoch: buf.get_u32_le(),
                nr_nodes: buf.get_u32_le(),
                status: buf.get_u32_le(),
            },
            BodyKind::None => RspBody::None,
        };
        Ok(Self {
            proto_ver,
            opcode,
            flags,
            epoch,
            id,
            data_length,
            result,
            body,
        })
    }
}

enum BodyKind {
    Obj,
    Vdi,
    Cluster,
    None,
}

fn body_kind(opcode: u8) -> BodyKind {
    match opcode {
        op::CREATE_AND_WRITE_OBJ | op::READ_OBJ | op::WRITE_OBJ | op::REMOVE_OBJ
        | op::GET_OBJ_LIST => BodyKind::Obj,
        op::NEW_VDI | op::DEL_VDI | op::GET_VDI_INFO | op::LOCK_VDI | op::RELEASE_VDI
        | op::READ_VDIS => BodyKind::Vdi,
        op::STAT_CLUSTER | op::MAKE_FS | op::SHUTDOWN | op::GET_EPOCH => BodyKind::Cluster,
        _ => BodyKind::None,
    }
}

/// Wire code for an error value. Total: unknown variants degrade to
/// `SYSTEM_ERROR` rather than panicking.
pub fn error_to_code(err: &Error) -> u32 {
    match err {
        Error::Io(_) => res::EIO,
        Error::NoObject => res::NO_OBJ,
        Error::ObjectExists => res::INVALID_PARMS,
        Error::VdiExists => res::VDI_EXIST,
        Error::NoVdi => res::NO_VDI,
        Error::VdiLocked => res::VDI_LOCKED,
        Error::FullVdi => res::FULL_VDI,
        Error::Startup => res::STARTUP,
        Error::Shutdown => res::SHUTDOWN,
        Error::VerMismatch => res::VER_MISMATCH,
        Error::NoSpace => res::NO_SPACE,
        Error::WaitForFormat => res::WAIT_FOR_FORMAT,
        Error::WaitForJoin => res::WAIT_FOR_JOIN,
        Error::JoinFailed => res::JOIN_FAILED,
        Error::Halt => res::HALT,
        Error::OldNodeVer => res::OLD_NODE_VER,
        Error::NewNodeVer => res::NEW_NODE_VER,
        Error::NotFormatted => res::NOT_FORMATTED,
        Error::InvalidCtime => res::INVALID_CTIME,
        Error::InvalidEpoch(_) => res::INVALID_EPOCH,
        Error::InsufficientZones { .. } => res::NO_SPACE,
        Error::InvalidParms(_) => res::INVALID_PARMS,
        Error::Timeout => res::EIO,
        Error::System(_) => res::SYSTEM_ERROR,
        Error::Unknown(_) => res::UNKNOWN,
    }
}

/// Error value for a wire code, `None` for success.
pub fn code_to_error(code: u32) -> Option<Error> {
    match code {
        res::SUCCESS => None,
        res::NO_OBJ => Some(Error::NoObject),
        res::EIO => Some(Error::Io(std::io::Error::other("remote i/o error"))),
        res::VDI_EXIST => Some(Error::VdiExists),
        res::INVALID_PARMS => Some(Error::InvalidParms("rejected by remote".into())),
        res::SYSTEM_ERROR => Some(Error::System("remote system error".into())),
        res::VDI_LOCKED => Some(Error::VdiLocked),
        res::NO_VDI => Some(Error::NoVdi),
        res::STARTUP => Some(Error::Startup),
        res::SHUTDOWN => Some(Error::Shutdown),
        res::FULL_VDI => Some(Error::FullVdi),
        res::VER_MISMATCH => Some(Error::VerMismatch),
        res::NO_SPACE => Some(Error::NoSpace),
        res::WAIT_FOR_FORMAT => Some(Error::WaitForFormat),
        res::WAIT_FOR_JOIN => Some(Error::WaitForJoin),
        res::JOIN_FAILED => Some(Error::JoinFailed),
        res::HALT => Some(Error::Halt),
        res::OLD_NODE_VER => Some(Error::OldNodeVer),
        res::NEW_NODE_VER => Some(Error::NewNodeVer),
        res::NOT_FORMATTED => Some(Error::NotFormatted),
        res::INVALID_CTIME => Some(Error::InvalidCtime),
        res::INVALID_EPOCH => Some(Error::InvalidEpoch(0)),
        other => Some(Error::Unknown(other)),
    }
}
