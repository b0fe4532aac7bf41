use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use log::error;

use super::*;
use crate::{TrafficError, TrafficResult};

// Completion codes the simulated fabric hands back on bad accesses; the
// values line up with the ibv_wc_status the native layer would report.
pub const WC_REMOTE_ACCESS_ERR: u32 = 10;
pub const WC_RNR_RETRY_EXC_ERR: u32 = 13;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SimQpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

struct SimQp {
    state: SimQpState,
    send_cq: u32,
    recv_cq: u32,
    recv_depth: usize,
    peer_qpn: Option<u32>,
    recv_queue: VecDeque<RecvWr>,
    // None: slots recycle as fast as the fabric completes them. Tests pin
    // this to a finite budget to force partial posts.
    sq_limit: Option<usize>,
}

struct SimMr {
    start: u64,
    length: u64,
    rkey: u32,
}

#[derive(Default)]
struct SimState {
    next_handle: u32,
    next_qpn: u32,
    cqs: HashMap<u32, VecDeque<Completion>>,
    qps: HashMap<u32, SimQp>,
    qpn_index: HashMap<u32, u32>,
    mrs: Vec<SimMr>,
    fail_next_modify: bool,
}

/// An in-process fabric: queue pairs wired to each other by queue pair
/// number, remote verbs acting on real process memory with rkey checks.
/// Contexts under test share one `SimVerbs` the way real contexts share
/// a physical network.
pub struct SimVerbs {
    gid: Gid,
    state: Mutex<SimState>,
}

impl SimVerbs {
    pub fn new() -> Self {
        let mut gid = Gid::default();
        gid.raw[10] = 0xff;
        gid.raw[11] = 0xff;
        gid.raw[12..16].copy_from_slice(&[10, 0, 0, 1]);
        Self {
            gid,
            state: Mutex::new(SimState {
                next_handle: 1,
                next_qpn: 100,
                ..Default::default()
            }),
        }
    }

    /// Pin a queue pair's remaining send-queue room so the next post is
    /// only partially accepted.
    pub fn limit_sq(&self, qp: QpHandle, room: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(q) = st.qps.get_mut(&qp.0) {
            q.sq_limit = Some(room);
        }
    }

    /// Make the next modify_to_* call fail, for activation-error paths.
    pub fn inject_modify_failure(&self) {
        self.state.lock().unwrap().fail_next_modify = true;
    }

    fn check_remote(st: &SimState, addr: u64, len: u64, rkey: u32) -> bool {
        st.mrs
            .iter()
            .any(|mr| mr.rkey == rkey && addr >= mr.start && addr + len <= mr.start + mr.length)
    }

    fn sgl_len(sgl: &[Sge]) -> u64 {
        sgl.iter().map(|s| s.length as u64).sum()
    }

    // Copy between a scatter-gather list and a flat remote address. The
    // addresses point at memory the test process really owns.
    unsafe fn copy_sgl_to_remote(sgl: &[Sge], mut dst: u64) {
        for sge in sgl {
            std::ptr::copy_nonoverlapping(
                sge.addr as *const u8,
                dst as *mut u8,
                sge.length as usize,
            );
            dst += sge.length as u64;
        }
    }

    unsafe fn copy_remote_to_sgl(mut src: u64, sgl: &[Sge]) {
        for sge in sgl {
            std::ptr::copy_nonoverlapping(
                src as *const u8,
                sge.addr as *mut u8,
                sge.length as usize,
            );
            src += sge.length as u64;
        }
    }

    unsafe fn copy_sgl_to_sgl(src: &[Sge], dst: &[Sge]) -> u64 {
        let mut copied = 0u64;
        let mut di = 0usize;
        let mut doff = 0u64;
        for sge in src {
            let mut remaining = sge.length as u64;
            let mut saddr = sge.addr;
            while remaining > 0 && di < dst.len() {
                let room = dst[di].length as u64 - doff;
                let n = remaining.min(room);
                std::ptr::copy_nonoverlapping(
                    saddr as *const u8,
                    (dst[di].addr + doff) as *mut u8,
                    n as usize,
                );
                saddr += n;
                doff += n;
                copied += n;
                remaining -= n;
                if doff == dst[di].length as u64 {
                    di += 1;
                    doff = 0;
                }
            }
        }
        copied
    }

    fn complete(st: &mut SimState, cq: u32, comp: Completion) {
        if let Some(queue) = st.cqs.get_mut(&cq) {
            queue.push_back(comp);
        }
    }

    // One work request through the fabric, end to end. Returns false when
    // the queue pair cannot take it (no send-queue room).
    fn process_send(st: &mut SimState, qp_handle: u32, wr: &SendWr) -> bool {
        let (send_cq, peer_qpn) = {
            let qp = st.qps.get_mut(&qp_handle).unwrap();
            if qp.state != SimQpState::Rts {
                error!("sim: post_send on a queue pair not in RTS");
                return false;
            }
            match qp.sq_limit {
                Some(0) => return false,
                Some(ref mut room) => *room -= 1,
                None => {}
            }
            (qp.send_cq, qp.peer_qpn)
        };
        let len = Self::sgl_len(&wr.sgl);
        let comp = match wr.opcode {
            Opcode::Send => {
                let delivered = Self::deliver(st, peer_qpn, &wr.sgl, WcOpcode::Recv);
                Completion {
                    wr_id: wr.wr_id,
                    status: if delivered { WC_SUCCESS } else { WC_RNR_RETRY_EXC_ERR },
                    opcode: WcOpcode::Send,
                    byte_len: len as u32,
                }
            }
            Opcode::Write | Opcode::WriteImm => {
                let ok = Self::check_remote(st, wr.remote_addr, len, wr.rkey);
                if ok {
                    unsafe { Self::copy_sgl_to_remote(&wr.sgl, wr.remote_addr) };
                    if wr.opcode == Opcode::WriteImm {
                        // write-with-imm consumes a receive on the peer
                        Self::deliver_imm(st, peer_qpn, len as u32);
                    }
                }
                Completion {
                    wr_id: wr.wr_id,
                    status: if ok { WC_SUCCESS } else { WC_REMOTE_ACCESS_ERR },
                    opcode: WcOpcode::RdmaWrite,
                    byte_len: len as u32,
                }
            }
            Opcode::Read => {
                let ok = Self::check_remote(st, wr.remote_addr, len, wr.rkey);
                if ok {
                    unsafe { Self::copy_remote_to_sgl(wr.remote_addr, &wr.sgl) };
                }
                Completion {
                    wr_id: wr.wr_id,
                    status: if ok { WC_SUCCESS } else { WC_REMOTE_ACCESS_ERR },
                    opcode: WcOpcode::RdmaRead,
                    byte_len: len as u32,
                }
            }
            Opcode::FetchAdd | Opcode::CmpSwap => {
                let ok = Self::check_remote(st, wr.remote_addr, 8, wr.rkey);
                if ok {
                    unsafe {
                        let target = wr.remote_addr as *mut u64;
                        let orig = *target;
                        if wr.opcode == Opcode::FetchAdd {
                            *target = orig.wrapping_add(wr.compare_add);
                        } else if orig == wr.compare_add {
                            *target = wr.swap;
                        }
                        if let Some(first) = wr.sgl.first() {
                            *(first.addr as *mut u64) = orig;
                        }
                    }
                }
                Completion {
                    wr_id: wr.wr_id,
                    status: if ok { WC_SUCCESS } else { WC_REMOTE_ACCESS_ERR },
                    opcode: if wr.opcode == Opcode::FetchAdd {
                        WcOpcode::FetchAdd
                    } else {
                        WcOpcode::CompSwap
                    },
                    byte_len: 8,
                }
            }
        };
        Self::complete(st, send_cq, comp);
        true
    }

    // A two-sided delivery: consume the peer's next receive and copy in.
    fn deliver(st: &mut SimState, peer_qpn: Option<u32>, sgl: &[Sge], opcode: WcOpcode) -> bool {
        let peer_handle = match peer_qpn.and_then(|qpn| st.qpn_index.get(&qpn).copied()) {
            Some(h) => h,
            None => return false,
        };
        let (recv_cq, recv_wr) = {
            let peer = st.qps.get_mut(&peer_handle).unwrap();
            match peer.recv_queue.pop_front() {
                Some(wr) => (peer.recv_cq, wr),
                None => return false,
            }
        };
        let copied = unsafe { Self::copy_sgl_to_sgl(sgl, &recv_wr.sgl) };
        Self::complete(
            st,
            recv_cq,
            Completion {
                wr_id: recv_wr.wr_id,
                status: WC_SUCCESS,
                opcode,
                byte_len: copied as u32,
            },
        );
        true
    }

    fn deliver_imm(st: &mut SimState, peer_qpn: Option<u32>, byte_len: u32) {
        let peer_handle = match peer_qpn.and_then(|qpn| st.qpn_index.get(&qpn).copied()) {
            Some(h) => h,
            None => return,
        };
        let (recv_cq, recv_wr) = {
            let peer = st.qps.get_mut(&peer_handle).unwrap();
            match peer.recv_queue.pop_front() {
                Some(wr) => (peer.recv_cq, wr),
                None => return,
            }
        };
        Self::complete(
            st,
            recv_cq,
            Completion {
                wr_id: recv_wr.wr_id,
                status: WC_SUCCESS,
                opcode: WcOpcode::RecvRdmaWithImm,
                byte_len,
            },
        );
    }

    fn take_modify_failure(st: &mut SimState) -> bool {
        let fail = st.fail_next_modify;
        st.fail_next_modify = false;
        fail
    }
}

impl Default for SimVerbs {
    fn default() -> Self {
        Self::new()
    }
}

impl RdmaVerbs for SimVerbs {
    fn open_device(&self, _devname: &str, _gid_idx: i32) -> TrafficResult<DeviceInfo> {
        Ok(DeviceInfo {
            gid: self.gid,
            lid: 7,
            sl: 0,
            max_qp_wr: 16384,
            max_sge: 32,
        })
    }

    fn alloc_pd(&self) -> TrafficResult<PdHandle> {
        let mut st = self.state.lock().unwrap();
        let h = st.next_handle;
        st.next_handle += 1;
        Ok(PdHandle(h))
    }

    fn create_cq(&self, _depth: i32) -> TrafficResult<CqHandle> {
        let mut st = self.state.lock().unwrap();
        let h = st.next_handle;
        st.next_handle += 1;
        st.cqs.insert(h, VecDeque::new());
        Ok(CqHandle(h))
    }

    fn create_qp(
        &self,
        _pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        attr: &QpInitAttr,
    ) -> TrafficResult<(QpHandle, u32)> {
        let mut st = self.state.lock().unwrap();
        let h = st.next_handle;
        st.next_handle += 1;
        let qpn = st.next_qpn;
        st.next_qpn += 1;
        st.qps.insert(
            h,
            SimQp {
                state: SimQpState::Reset,
                send_cq: send_cq.0,
                recv_cq: recv_cq.0,
                recv_depth: attr.recv_wq_depth as usize,
                peer_qpn: None,
                recv_queue: VecDeque::new(),
                sq_limit: None,
            },
        );
        st.qpn_index.insert(qpn, h);
        Ok((QpHandle(h), qpn))
    }

    fn reg_mr(&self, _pd: PdHandle, addr: u64, length: usize, _odp: bool) -> TrafficResult<MrInfo> {
        let mut st = self.state.lock().unwrap();
        let key = 0x1000 + st.mrs.len() as u32;
        st.mrs.push(SimMr {
            start: addr,
            length: length as u64,
            rkey: key,
        });
        Ok(MrInfo { lkey: key, rkey: key })
    }

    fn modify_to_init(&self, qp: QpHandle, _qp_type: QpType) -> TrafficResult<()> {
        let mut st = self.state.lock().unwrap();
        if Self::take_modify_failure(&mut st) {
            return Err(TrafficError::TransportError);
        }
        let q = st.qps.get_mut(&qp.0).ok_or(TrafficError::TransportError)?;
        if q.state != SimQpState::Reset {
            return Err(TrafficError::TransportError);
        }
        q.state = SimQpState::Init;
        Ok(())
    }

    fn modify_to_rtr(
        &self,
        qp: QpHandle,
        _qp_type: QpType,
        remote: &PeerAddr,
        _gid_idx: i32,
    ) -> TrafficResult<()> {
        let mut st = self.state.lock().unwrap();
        if Self::take_modify_failure(&mut st) {
            return Err(TrafficError::TransportError);
        }
        let q = st.qps.get_mut(&qp.0).ok_or(TrafficError::TransportError)?;
        if q.state != SimQpState::Init {
            return Err(TrafficError::TransportError);
        }
        q.state = SimQpState::Rtr;
        q.peer_qpn = Some(remote.qpn);
        Ok(())
    }

    fn modify_to_rts(&self, qp: QpHandle, _qp_type: QpType) -> TrafficResult<()> {
        let mut st = self.state.lock().unwrap();
        if Self::take_modify_failure(&mut st) {
            return Err(TrafficError::TransportError);
        }
        let q = st.qps.get_mut(&qp.0).ok_or(TrafficError::TransportError)?;
        if q.state != SimQpState::Rtr {
            return Err(TrafficError::TransportError);
        }
        q.state = SimQpState::Rts;
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> TrafficResult<usize> {
        let mut st = self.state.lock().unwrap();
        if !st.qps.contains_key(&qp.0) {
            return Err(TrafficError::TransportError);
        }
        let mut accepted = 0;
        for wr in wrs {
            if !Self::process_send(&mut st, qp.0, wr) {
                break;
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> TrafficResult<usize> {
        let mut st = self.state.lock().unwrap();
        let q = st.qps.get_mut(&qp.0).ok_or(TrafficError::TransportError)?;
        let mut accepted = 0;
        for wr in wrs {
            if q.recv_queue.len() >= q.recv_depth {
                break;
            }
            q.recv_queue.push_back(wr.clone());
            accepted += 1;
        }
        Ok(accepted)
    }

    fn poll_cq(
        &self,
        cq: CqHandle,
        max: usize,
        completions: &mut Vec<Completion>,
    ) -> TrafficResult<usize> {
        let mut st = self.state.lock().unwrap();
        let queue = st.cqs.get_mut(&cq.0).ok_or(TrafficError::TransportError)?;
        let mut n = 0;
        while n < max {
            match queue.pop_front() {
                Some(comp) => {
                    completions.push(comp);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}
