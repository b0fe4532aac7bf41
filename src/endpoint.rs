use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::error;

use crate::memory::RdmaBuffer;
use crate::request::RdmaRequest;
use crate::verbs::{
    Completion, Gid, Opcode, PeerAddr, QpHandle, QpType, RdmaVerbs, RecvWr, SendWr,
};
use crate::{TrafficError, TrafficResult};

/// One queue pair's lifecycle: created Inactive at transport init,
/// promoted to Active by a successful handshake, then driven by exactly
/// one datapath thread. A failed activate leaves it Inactive for good.
pub struct RdmaEndpoint {
    id: usize,
    qp: QpHandle,
    qpn: u32,
    qp_type: QpType,
    gid_idx: i32,
    activated: bool,

    // peer addressing learned from the channel-info exchange
    remote_qpn: u32,
    dlid: u16,
    sl: u8,
    remote_gid: Gid,

    mem_id: usize,
    server: String,

    send_credits: i32,
    recv_credits: i32,
    send_wq_depth: u32,
    recv_wq_depth: u32,

    // remote-pool rotation for outgoing one-sided requests
    rmem_idx: usize,

    // byte size of every in-flight send, popped per completion
    outstanding: VecDeque<u32>,

    bytes_acc: u64,
    ops_acc: u64,
    last_sample: Instant,
    pub start_time: Instant,

    verbs: Arc<dyn RdmaVerbs>,
}

impl RdmaEndpoint {
    pub fn new(
        id: usize,
        qp: QpHandle,
        qpn: u32,
        qp_type: QpType,
        gid_idx: i32,
        send_wq_depth: u32,
        recv_wq_depth: u32,
        verbs: Arc<dyn RdmaVerbs>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            qp,
            qpn,
            qp_type,
            gid_idx,
            activated: false,
            remote_qpn: 0,
            dlid: 0,
            sl: 0,
            remote_gid: Gid::default(),
            mem_id: 0,
            server: String::new(),
            send_credits: send_wq_depth as i32,
            recv_credits: recv_wq_depth as i32,
            send_wq_depth,
            recv_wq_depth,
            rmem_idx: 0,
            outstanding: VecDeque::new(),
            bytes_acc: 0,
            ops_acc: 0,
            last_sample: now,
            start_time: now,
            verbs,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn qp(&self) -> QpHandle {
        self.qp
    }

    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    pub fn activated(&self) -> bool {
        self.activated
    }

    pub fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
    }

    pub fn mem_id(&self) -> usize {
        self.mem_id
    }

    pub fn set_mem_id(&mut self, mem_id: usize) {
        self.mem_id = mem_id;
    }

    pub fn set_server(&mut self, server: String) {
        self.server = server;
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn set_remote_qpn(&mut self, qpn: u32) {
        self.remote_qpn = qpn;
    }

    pub fn set_remote_path(&mut self, dlid: u16, sl: u8) {
        self.dlid = dlid;
        self.sl = sl;
    }

    pub fn send_credits(&self) -> i32 {
        self.send_credits
    }

    pub fn recv_credits(&self) -> i32 {
        self.recv_credits
    }

    pub fn send_wq_depth(&self) -> u32 {
        self.send_wq_depth
    }

    pub fn recv_wq_depth(&self) -> u32 {
        self.recv_wq_depth
    }

    pub fn outstanding_sends(&self) -> usize {
        self.outstanding.len()
    }

    /// Operations completed since the last throughput sample.
    pub fn accumulated_ops(&self) -> u64 {
        self.ops_acc
    }

    /// Walk the queue pair reset -> init -> rtr -> rts against the peer
    /// addressing collected during the handshake. On failure the endpoint
    /// stays inactive and must not be used for posting.
    pub fn activate(&mut self, remote_gid: Gid) -> TrafficResult<()> {
        if self.activated {
            return Ok(());
        }
        self.remote_gid = remote_gid;
        let remote = PeerAddr {
            qpn: self.remote_qpn,
            lid: self.dlid,
            sl: self.sl,
            gid: self.remote_gid,
        };
        self.verbs
            .modify_to_init(self.qp, self.qp_type)
            .map_err(|_| {
                error!("endpoint {}: modify to INIT failed", self.id);
                TrafficError::ActivateError
            })?;
        self.verbs
            .modify_to_rtr(self.qp, self.qp_type, &remote, self.gid_idx)
            .map_err(|_| {
                error!("endpoint {}: modify to RTR failed", self.id);
                TrafficError::ActivateError
            })?;
        self.verbs
            .modify_to_rts(self.qp, self.qp_type)
            .map_err(|_| {
                error!("endpoint {}: modify to RTS failed", self.id);
                TrafficError::ActivateError
            })?;
        Ok(())
    }

    /// Post up to `count` requests drawn round-robin from `requests`,
    /// remote addresses rotating over `remote_pool`. The caller pre-checks
    /// credits; a partial acceptance by the transport reports exactly how
    /// many were taken and only those consume credit.
    pub fn post_send(
        &mut self,
        requests: &[RdmaRequest],
        cursor: &mut usize,
        count: u32,
        remote_pool: &[RdmaBuffer],
    ) -> TrafficResult<()> {
        if requests.is_empty() || remote_pool.is_empty() {
            error!("endpoint {}: nothing to post from", self.id);
            return Err(TrafficError::ConfigError);
        }
        if count as i32 > self.send_credits {
            error!(
                "endpoint {}: {} requests exceed {} send credits",
                self.id, count, self.send_credits
            );
            return Err(TrafficError::NoCredits);
        }
        let mut wrs = Vec::with_capacity(count as usize);
        let mut sizes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let req = &requests[*cursor % requests.len()];
            *cursor = (*cursor + 1) % requests.len();
            let rbuf = remote_pool[self.rmem_idx];
            self.rmem_idx = (self.rmem_idx + 1) % remote_pool.len();
            sizes.push(req.sgl.iter().map(|s| s.length).sum::<u32>());
            wrs.push(SendWr {
                wr_id: self.id as u64,
                opcode: req.opcode,
                sgl: req.sgl.clone(),
                remote_addr: rbuf.addr,
                rkey: rbuf.rkey,
                imm: 0,
                compare_add: if req.opcode == Opcode::FetchAdd { 1 } else { 0 },
                swap: 0,
            });
        }
        let accepted = self.verbs.post_send(self.qp, &wrs)?;
        self.send_credits -= accepted as i32;
        for size in sizes.iter().take(accepted) {
            self.outstanding.push_back(*size);
        }
        self.start_time = Instant::now();
        if accepted < count as usize {
            error!(
                "endpoint {}: posted only {}/{} send requests",
                self.id, accepted, count
            );
            return Err(TrafficError::PartialPost(accepted));
        }
        Ok(())
    }

    /// Symmetric to post_send without remote addressing. Credit is
    /// consumed at post time and restored by recv_handler.
    pub fn post_recv(
        &mut self,
        requests: &[RdmaRequest],
        cursor: &mut usize,
        count: u32,
    ) -> TrafficResult<()> {
        if requests.is_empty() {
            error!("endpoint {}: empty receive template", self.id);
            return Err(TrafficError::ConfigError);
        }
        if count as i32 > self.recv_credits {
            error!(
                "endpoint {}: {} requests exceed {} recv credits",
                self.id, count, self.recv_credits
            );
            return Err(TrafficError::NoCredits);
        }
        let mut wrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let req = &requests[*cursor % requests.len()];
            *cursor = (*cursor + 1) % requests.len();
            wrs.push(RecvWr {
                wr_id: self.id as u64,
                sgl: req.sgl.clone(),
            });
        }
        let accepted = self.verbs.post_recv(self.qp, &wrs)?;
        self.recv_credits -= accepted as i32;
        if accepted < count as usize {
            error!(
                "endpoint {}: posted only {}/{} recv requests",
                self.id, accepted, count
            );
            return Err(TrafficError::PartialPost(accepted));
        }
        Ok(())
    }

    /// One matched send-class completion: credit back, accounting forward.
    pub fn send_handler(&mut self, wc: &Completion) {
        self.send_credits += 1;
        let bytes = self.outstanding.pop_front().unwrap_or(wc.byte_len);
        self.bytes_acc += bytes as u64;
        self.ops_acc += 1;
    }

    pub fn recv_handler(&mut self, wc: &Completion) {
        self.recv_credits += 1;
        self.bytes_acc += wc.byte_len as u64;
        self.ops_acc += 1;
    }

    /// (bandwidth Gbps, rate Mops) since the previous call; a consuming
    /// sample, not a running average.
    pub fn get_throughput(&mut self, now: Instant) -> (f64, f64) {
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        if elapsed <= 0.0 {
            return (0.0, 0.0);
        }
        let bw = (self.bytes_acc as f64) * 8.0 / elapsed / 1e9;
        let rate = (self.ops_acc as f64) / elapsed / 1e6;
        self.bytes_acc = 0;
        self.ops_acc = 0;
        self.last_sample = now;
        (bw, rate)
    }
}
