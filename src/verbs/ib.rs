use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use errno::errno;
use log::error;
use rdma_sys::*;

use super::*;
use crate::{TrafficError, TrafficResult, MAX_SGE};

const IB_PORT: u8 = 1;
const UD_QKEY: u32 = 0x11111111;

struct IbQp {
    qp: *mut ibv_qp,
    // address handle and peer qpn for datagram sends, installed at RTR
    ah: *mut ibv_ah,
    peer_qpn: u32,
}

struct IbState {
    ctx: *mut ibv_context,
    pd_of_qp: HashMap<u32, *mut ibv_pd>,
    next_handle: u32,
    pds: HashMap<u32, *mut ibv_pd>,
    cqs: HashMap<u32, *mut ibv_cq>,
    qps: HashMap<u32, IbQp>,
}

/// The real device, straight through rdma-sys.
pub struct IbvVerbs {
    state: Mutex<IbState>,
}

unsafe impl Send for IbvVerbs {}
unsafe impl Sync for IbvVerbs {}

impl IbvVerbs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IbState {
                ctx: std::ptr::null_mut(),
                pd_of_qp: HashMap::new(),
                next_handle: 1,
                pds: HashMap::new(),
                cqs: HashMap::new(),
                qps: HashMap::new(),
            }),
        }
    }

    fn access_flags() -> u32 {
        (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
            .0
    }

    fn opcode_raw(op: Opcode) -> ibv_wr_opcode::Type {
        match op {
            Opcode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Opcode::WriteImm => ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            Opcode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
            Opcode::Send => ibv_wr_opcode::IBV_WR_SEND,
            Opcode::FetchAdd => ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
            Opcode::CmpSwap => ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
        }
    }

    fn wc_opcode(raw: ibv_wc_opcode::Type) -> Option<WcOpcode> {
        match raw {
            ibv_wc_opcode::IBV_WC_SEND => Some(WcOpcode::Send),
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => Some(WcOpcode::RdmaWrite),
            ibv_wc_opcode::IBV_WC_RDMA_READ => Some(WcOpcode::RdmaRead),
            ibv_wc_opcode::IBV_WC_COMP_SWAP => Some(WcOpcode::CompSwap),
            ibv_wc_opcode::IBV_WC_FETCH_ADD => Some(WcOpcode::FetchAdd),
            ibv_wc_opcode::IBV_WC_RECV => Some(WcOpcode::Recv),
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => Some(WcOpcode::RecvRdmaWithImm),
            _ => None,
        }
    }
}

impl Default for IbvVerbs {
    fn default() -> Self {
        Self::new()
    }
}

impl RdmaVerbs for IbvVerbs {
    fn open_device(&self, devname: &str, gid_idx: i32) -> TrafficResult<DeviceInfo> {
        let mut st = self.state.lock().unwrap();
        let mut n = 0i32;
        let device_list = unsafe { ibv_get_device_list(&mut n) };
        if device_list.is_null() {
            error!("ibv_get_device_list() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let devices = unsafe { std::slice::from_raw_parts(device_list, n as usize) };
        let wanted = CString::new(devname).map_err(|_| TrafficError::ConfigError)?;
        let mut dev = std::ptr::null_mut();
        for d in devices {
            let name = unsafe { std::ffi::CStr::from_ptr(ibv_get_device_name(*d)) };
            if name.to_bytes().starts_with(wanted.as_bytes()) {
                dev = *d;
                break;
            }
        }
        if dev.is_null() {
            error!("no such device: {}", devname);
            unsafe { ibv_free_device_list(device_list) };
            return Err(TrafficError::ConfigError);
        }
        let ctx = unsafe { ibv_open_device(dev) };
        unsafe { ibv_free_device_list(device_list) };
        if ctx.is_null() {
            error!("ibv_open_device() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }

        let mut device_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        if unsafe { ibv_query_device(ctx, &mut device_attr) } != 0 {
            error!("ibv_query_device() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        if unsafe { ___ibv_query_port(ctx, IB_PORT, &mut port_attr) } != 0 {
            error!("ibv_query_port() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let mut gid = unsafe { std::mem::zeroed::<ibv_gid>() };
        if unsafe { ibv_query_gid(ctx, IB_PORT, gid_idx, &mut gid) } != 0 {
            error!("ibv_query_gid() failed for index {}", gid_idx);
            return Err(TrafficError::TransportError);
        }

        st.ctx = ctx;
        Ok(DeviceInfo {
            gid: Gid {
                raw: unsafe { gid.raw },
            },
            lid: port_attr.lid,
            sl: port_attr.sm_sl,
            max_qp_wr: device_attr.max_qp_wr as u32,
            max_sge: device_attr.max_sge as u32,
        })
    }

    fn alloc_pd(&self) -> TrafficResult<PdHandle> {
        let mut st = self.state.lock().unwrap();
        let pd = unsafe { ibv_alloc_pd(st.ctx) };
        if pd.is_null() {
            error!("ibv_alloc_pd() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let h = st.next_handle;
        st.next_handle += 1;
        st.pds.insert(h, pd);
        Ok(PdHandle(h))
    }

    fn create_cq(&self, depth: i32) -> TrafficResult<CqHandle> {
        let mut st = self.state.lock().unwrap();
        let cq = unsafe {
            ibv_create_cq(st.ctx, depth, std::ptr::null_mut(), std::ptr::null_mut(), 0)
        };
        if cq.is_null() {
            error!("ibv_create_cq() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let h = st.next_handle;
        st.next_handle += 1;
        st.cqs.insert(h, cq);
        Ok(CqHandle(h))
    }

    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        attr: &QpInitAttr,
    ) -> TrafficResult<(QpHandle, u32)> {
        let mut st = self.state.lock().unwrap();
        let pd_ptr = *st.pds.get(&pd.0).ok_or(TrafficError::TransportError)?;
        let send_cq_ptr = *st.cqs.get(&send_cq.0).ok_or(TrafficError::TransportError)?;
        let recv_cq_ptr = *st.cqs.get(&recv_cq.0).ok_or(TrafficError::TransportError)?;

        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.qp_type = match attr.qp_type {
            QpType::Rc => ibv_qp_type::IBV_QPT_RC,
            QpType::Uc => ibv_qp_type::IBV_QPT_UC,
            QpType::Ud => ibv_qp_type::IBV_QPT_UD,
        };
        init_attr.send_cq = send_cq_ptr;
        init_attr.recv_cq = recv_cq_ptr;
        init_attr.cap.max_send_wr = attr.send_wq_depth;
        init_attr.cap.max_recv_wr = attr.recv_wq_depth;
        init_attr.cap.max_send_sge = attr.max_send_sge;
        init_attr.cap.max_recv_sge = attr.max_recv_sge;
        init_attr.sq_sig_all = 1;

        let qp = unsafe { ibv_create_qp(pd_ptr, &mut init_attr) };
        if qp.is_null() {
            error!("ibv_create_qp() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        let qpn = unsafe { (*qp).qp_num };
        let h = st.next_handle;
        st.next_handle += 1;
        st.qps.insert(
            h,
            IbQp {
                qp,
                ah: std::ptr::null_mut(),
                peer_qpn: 0,
            },
        );
        st.pd_of_qp.insert(h, pd_ptr);
        Ok((QpHandle(h), qpn))
    }

    fn reg_mr(&self, pd: PdHandle, addr: u64, length: usize, odp: bool) -> TrafficResult<MrInfo> {
        let st = self.state.lock().unwrap();
        let pd_ptr = *st.pds.get(&pd.0).ok_or(TrafficError::TransportError)?;
        let mr = if odp {
            // whole-address-space registration, pages fault in on access
            let flags = Self::access_flags() | ibv_access_flags::IBV_ACCESS_ON_DEMAND.0;
            unsafe { ibv_reg_mr(pd_ptr, std::ptr::null_mut(), u64::MAX as usize, flags as i32) }
        } else {
            unsafe {
                ibv_reg_mr(
                    pd_ptr,
                    addr as *mut libc::c_void,
                    length,
                    Self::access_flags() as i32,
                )
            }
        };
        if mr.is_null() {
            error!("ibv_reg_mr() failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        Ok(MrInfo {
            lkey: unsafe { (*mr).lkey },
            rkey: unsafe { (*mr).rkey },
        })
    }

    fn modify_to_init(&self, qp: QpHandle, qp_type: QpType) -> TrafficResult<()> {
        let st = self.state.lock().unwrap();
        let ibqp = st.qps.get(&qp.0).ok_or(TrafficError::TransportError)?;
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = IB_PORT;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT;
        if qp_type.is_datagram() {
            attr.qkey = UD_QKEY;
            flags |= ibv_qp_attr_mask::IBV_QP_QKEY;
        } else {
            attr.qp_access_flags = Self::access_flags();
            flags |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        }
        let ret = unsafe { ibv_modify_qp(ibqp.qp, &mut attr, flags.0 as i32) };
        if ret != 0 {
            error!("ibv_modify_qp(INIT) failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        Ok(())
    }

    fn modify_to_rtr(
        &self,
        qp: QpHandle,
        qp_type: QpType,
        remote: &PeerAddr,
        gid_idx: i32,
    ) -> TrafficResult<()> {
        let mut st = self.state.lock().unwrap();
        let qp_pd = st.pd_of_qp.get(&qp.0).copied();
        let ibqp = st.qps.get_mut(&qp.0).ok_or(TrafficError::TransportError)?;
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE;

        if !qp_type.is_datagram() {
            attr.path_mtu = ibv_mtu::IBV_MTU_1024;
            attr.dest_qp_num = remote.qpn;
            attr.rq_psn = 0;
            attr.ah_attr.is_global = 1;
            attr.ah_attr.dlid = remote.lid;
            attr.ah_attr.sl = remote.sl;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = IB_PORT;
            attr.ah_attr.grh.dgid.raw = remote.gid.raw;
            attr.ah_attr.grh.flow_label = 0;
            attr.ah_attr.grh.hop_limit = 1;
            attr.ah_attr.grh.sgid_index = gid_idx as u8;
            attr.ah_attr.grh.traffic_class = 0;
            flags |= ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN;
        }
        if qp_type == QpType::Rc {
            attr.max_dest_rd_atomic = 1;
            attr.min_rnr_timer = 12;
            flags |= ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        }

        let ret = unsafe { ibv_modify_qp(ibqp.qp, &mut attr, flags.0 as i32) };
        if ret != 0 {
            error!("ibv_modify_qp(RTR) failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }

        if qp_type.is_datagram() {
            // datagram sends address the peer through an AH, not the QP
            let mut ah_attr = unsafe { std::mem::zeroed::<ibv_ah_attr>() };
            ah_attr.is_global = 1;
            ah_attr.dlid = remote.lid;
            ah_attr.sl = remote.sl;
            ah_attr.port_num = IB_PORT;
            ah_attr.grh.dgid.raw = remote.gid.raw;
            ah_attr.grh.hop_limit = 1;
            ah_attr.grh.sgid_index = gid_idx as u8;
            let pd_ptr = qp_pd.ok_or(TrafficError::TransportError)?;
            let ah = unsafe { ibv_create_ah(pd_ptr, &mut ah_attr) };
            if ah.is_null() {
                error!("ibv_create_ah() failed, errno = {}", errno());
                return Err(TrafficError::TransportError);
            }
            ibqp.ah = ah;
            ibqp.peer_qpn = remote.qpn;
        }
        Ok(())
    }

    fn modify_to_rts(&self, qp: QpHandle, qp_type: QpType) -> TrafficResult<()> {
        let st = self.state.lock().unwrap();
        let ibqp = st.qps.get(&qp.0).ok_or(TrafficError::TransportError)?;
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = 0;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        if qp_type == QpType::Rc {
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 1;
            flags |= ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        }
        let ret = unsafe { ibv_modify_qp(ibqp.qp, &mut attr, flags.0 as i32) };
        if ret != 0 {
            error!("ibv_modify_qp(RTS) failed, errno = {}", errno());
            return Err(TrafficError::TransportError);
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[SendWr]) -> TrafficResult<usize> {
        let st = self.state.lock().unwrap();
        let ibqp = st.qps.get(&qp.0).ok_or(TrafficError::TransportError)?;

        let mut sges = vec![[ibv_sge { addr: 0, length: 0, lkey: 0 }; MAX_SGE]; wrs.len()];
        let mut raw = vec![unsafe { std::mem::zeroed::<ibv_send_wr>() }; wrs.len()];
        for (i, wr) in wrs.iter().enumerate() {
            for (j, sge) in wr.sgl.iter().enumerate() {
                sges[i][j] = ibv_sge {
                    addr: sge.addr,
                    length: sge.length,
                    lkey: sge.lkey,
                };
            }
            raw[i].wr_id = wr.wr_id;
            raw[i].opcode = Self::opcode_raw(wr.opcode);
            raw[i].num_sge = wr.sgl.len() as i32;
            raw[i].sg_list = sges[i].as_mut_ptr();
            raw[i].send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            match wr.opcode {
                Opcode::Write | Opcode::WriteImm | Opcode::Read => {
                    raw[i].wr.rdma.remote_addr = wr.remote_addr;
                    raw[i].wr.rdma.rkey = wr.rkey;
                    if wr.opcode == Opcode::WriteImm {
                        raw[i].imm_data_invalidated_rkey_union.imm_data = wr.imm;
                    }
                }
                Opcode::FetchAdd | Opcode::CmpSwap => {
                    raw[i].wr.atomic.remote_addr = wr.remote_addr;
                    raw[i].wr.atomic.rkey = wr.rkey;
                    raw[i].wr.atomic.compare_add = wr.compare_add;
                    raw[i].wr.atomic.swap = wr.swap;
                }
                Opcode::Send => {
                    if !ibqp.ah.is_null() {
                        raw[i].wr.ud.ah = ibqp.ah;
                        raw[i].wr.ud.remote_qpn = ibqp.peer_qpn;
                        raw[i].wr.ud.remote_qkey = UD_QKEY;
                    }
                }
            }
        }
        for i in 0..raw.len() {
            raw[i].next = if i + 1 == raw.len() {
                std::ptr::null_mut()
            } else {
                &mut raw[i + 1] as *mut _
            };
        }

        let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send((*ibqp).qp, raw.as_mut_ptr(), &mut bad_wr) };
        if ret != 0 {
            // the chain was taken up to (not including) bad_wr
            let accepted = raw
                .iter()
                .position(|wr| wr as *const _ == bad_wr as *const _)
                .unwrap_or(raw.len());
            error!("ibv_post_send() failed, errno = {}", errno());
            return Ok(accepted);
        }
        Ok(wrs.len())
    }

    fn post_recv(&self, qp: QpHandle, wrs: &[RecvWr]) -> TrafficResult<usize> {
        let st = self.state.lock().unwrap();
        let ibqp = st.qps.get(&qp.0).ok_or(TrafficError::TransportError)?;

        let mut sges = vec![[ibv_sge { addr: 0, length: 0, lkey: 0 }; MAX_SGE]; wrs.len()];
        let mut raw = vec![unsafe { std::mem::zeroed::<ibv_recv_wr>() }; wrs.len()];
        for (i, wr) in wrs.iter().enumerate() {
            for (j, sge) in wr.sgl.iter().enumerate() {
                sges[i][j] = ibv_sge {
                    addr: sge.addr,
                    length: sge.length,
                    lkey: sge.lkey,
                };
            }
            raw[i].wr_id = wr.wr_id;
            raw[i].num_sge = wr.sgl.len() as i32;
            raw[i].sg_list = sges[i].as_mut_ptr();
        }
        for i in 0..raw.len() {
            raw[i].next = if i + 1 == raw.len() {
                std::ptr::null_mut()
            } else {
                &mut raw[i + 1] as *mut _
            };
        }

        let mut bad_wr: *mut ibv_recv_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_recv((*ibqp).qp, raw.as_mut_ptr(), &mut bad_wr) };
        if ret != 0 {
            let accepted = raw
                .iter()
                .position(|wr| wr as *const _ == bad_wr as *const _)
                .unwrap_or(raw.len());
            error!("ibv_post_recv() failed, errno = {}", errno());
            return Ok(accepted);
        }
        Ok(wrs.len())
    }

    fn poll_cq(
        &self,
        cq: CqHandle,
        max: usize,
        completions: &mut Vec<Completion>,
    ) -> TrafficResult<usize> {
        let st = self.state.lock().unwrap();
        let cq_ptr = *st.cqs.get(&cq.0).ok_or(TrafficError::TransportError)?;
        let mut wcs = vec![unsafe { std::mem::zeroed::<ibv_wc>() }; max];
        let n = unsafe { ibv_poll_cq(cq_ptr, max as i32, wcs.as_mut_ptr()) };
        if n < 0 {
            error!("ibv_poll_cq() failed");
            return Err(TrafficError::CompletionError);
        }
        for wc in wcs.iter().take(n as usize) {
            let opcode = match Self::wc_opcode(wc.opcode) {
                Some(op) => op,
                None => {
                    error!("unknown completion opcode {}", wc.opcode);
                    return Err(TrafficError::CompletionError);
                }
            };
            completions.push(Completion {
                wr_id: wc.wr_id,
                status: wc.status,
                opcode,
                byte_len: wc.byte_len,
            });
        }
        Ok(n as usize)
    }
}
