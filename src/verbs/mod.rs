pub mod sim;
#[cfg(feature = "verbs")]
pub mod ib;

use crate::TrafficResult;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PdHandle(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CqHandle(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QpHandle(pub u32);

/// RDMA-layer address, 16 raw bytes as reported by the device.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Gid {
    pub raw: [u8; 16],
}

impl Gid {
    // RoCE v2 keeps an IPv4-mapped address in the last four bytes.
    pub fn to_ip(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.raw[12], self.raw[13], self.raw[14], self.raw[15]
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QpType {
    Rc,
    Uc,
    Ud,
}

impl QpType {
    // The numbering the verbs headers use: 2 = RC, 3 = UC, 4 = UD.
    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            2 => Some(QpType::Rc),
            3 => Some(QpType::Uc),
            4 => Some(QpType::Ud),
            _ => None,
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, QpType::Ud)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Write,
    WriteImm,
    Read,
    Send,
    FetchAdd,
    CmpSwap,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    Recv,
    RecvRdmaWithImm,
}

impl WcOpcode {
    pub fn is_recv(&self) -> bool {
        matches!(self, WcOpcode::Recv | WcOpcode::RecvRdmaWithImm)
    }
}

pub const WC_SUCCESS: u32 = 0;

#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Clone, Debug)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub sgl: Vec<Sge>,
    pub remote_addr: u64,
    pub rkey: u32,
    pub imm: u32,
    pub compare_add: u64,
    pub swap: u64,
}

#[derive(Clone, Debug)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sgl: Vec<Sge>,
}

/// Peer-side addressing negotiated over the rendezvous channel.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddr {
    pub qpn: u32,
    pub lid: u16,
    pub sl: u8,
    pub gid: Gid,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    pub gid: Gid,
    pub lid: u16,
    pub sl: u8,
    pub max_qp_wr: u32,
    pub max_sge: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct MrInfo {
    pub lkey: u32,
    pub rkey: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub send_wq_depth: u32,
    pub recv_wq_depth: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// The native verbs surface the engine consumes. Everything above the
/// device driver talks through this, so the protocol and datapath run
/// unchanged against the simulated fabric in tests.
pub trait RdmaVerbs: Send + Sync {
    fn open_device(&self, devname: &str, gid_idx: i32) -> TrafficResult<DeviceInfo>;

    fn alloc_pd(&self) -> TrafficResult<PdHandle>;

    fn create_cq(&self, depth: i32) -> TrafficResult<CqHandle>;

    /// Returns the handle and the queue pair number the peer addresses.
    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        attr: &QpInitAttr,
    ) -> TrafficResult<(QpHandle, u32)>;

    fn reg_mr(&self, pd: PdHandle, addr: u64, length: usize, odp: bool) -> TrafficResult<MrInfo>;

    fn modify_to_init(&self, qp: QpHandle, qp_type: QpType) -> TrafficResult<()>;

    fn modify_to_rtr(
        &self,
        qp: QpHandle,
        qp_type: QpType,
        remote: &PeerAddr,
        gid_idx: i32,
    ) -> TrafficResult<()>;

    fn modify_to_rts(&self, qp: QpHandle, qp_type: QpType) -> TrafficResult<()>;

    /// Posts as many of `wrs` as the queue accepts, in order, and returns
    /// the accepted count. Callers decide whether a shortfall is an error.
    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> TrafficResult<usize>;

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> TrafficResult<usize>;

    /// Drains up to `max` entries into `completions`; returns how many.
    fn poll_cq(
        &self,
        cq: CqHandle,
        max: usize,
        completions: &mut Vec<Completion>,
    ) -> TrafficResult<usize>;
}
