use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::config::Config;
use crate::endpoint::RdmaEndpoint;
use crate::memory::{BufferPool, PoolSelector, RdmaBuffer, RdmaRegion};
use crate::verbs::{CqHandle, DeviceInfo, Gid, PdHandle, QpInitAttr, QpType, RdmaVerbs};
use crate::{TrafficError, TrafficResult, MAX_SGE, UD_ADDITION};

/// Owns every per-device resource: PDs, CQs, the two local buffer pools,
/// the endpoint table and the shared handshake state. One context per
/// server or per client thread.
pub struct RdmaContext {
    verbs: Arc<dyn RdmaVerbs>,
    config: Config,
    qp_type: QpType,

    device: DeviceInfo,
    local_ip: String,

    pds: Vec<PdHandle>,
    send_cqs: Vec<CqHandle>,
    recv_cqs: Vec<CqHandle>,

    // Recv pool first, Send pool second; see PoolSelector.
    mempools: [Mutex<BufferPool>; 2],

    endpoints: Vec<Option<Arc<Mutex<RdmaEndpoint>>>>,

    // The next free endpoint id. The one counter every handshake thread
    // races on; reserve-and-advance only.
    num_of_recv: Mutex<usize>,

    // Remote descriptors per peer connection, append-only; the index at
    // append time becomes the connection's mem_id.
    remote_mempools: Mutex<Vec<Vec<RdmaBuffer>>>,

    // Per-send-completion latency samples, client side.
    latency: Mutex<Vec<u64>>,

    stop: AtomicBool,
}

impl RdmaContext {
    pub fn new(verbs: Arc<dyn RdmaVerbs>, config: Config) -> TrafficResult<Self> {
        let qp_type = config.qp_type()?;
        let mut ctx = Self {
            verbs,
            config,
            qp_type,
            device: DeviceInfo {
                gid: Gid::default(),
                lid: 0,
                sl: 0,
                max_qp_wr: 0,
                max_sge: 0,
            },
            local_ip: String::new(),
            pds: Vec::new(),
            send_cqs: Vec::new(),
            recv_cqs: Vec::new(),
            mempools: [Mutex::new(BufferPool::new()), Mutex::new(BufferPool::new())],
            endpoints: Vec::new(),
            num_of_recv: Mutex::new(0),
            remote_mempools: Mutex::new(Vec::new()),
            latency: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        };
        ctx.init_device()?;
        ctx.init_memory()?;
        ctx.init_transport()?;
        Ok(ctx)
    }

    fn init_device(&mut self) -> TrafficResult<()> {
        self.device = self
            .verbs
            .open_device(&self.config.dev, self.config.gid_idx)?;
        if MAX_SGE as u32 > self.device.max_sge {
            error!(
                "MAX_SGE is too large, the device supports {}",
                self.device.max_sge
            );
            return Err(TrafficError::ConfigError);
        }
        if self.config.send_wq_depth > self.device.max_qp_wr
            || self.config.recv_wq_depth > self.device.max_qp_wr
        {
            error!(
                "work queue depth {}/{} exceeds the device limit {}",
                self.config.send_wq_depth, self.config.recv_wq_depth, self.device.max_qp_wr
            );
            return Err(TrafficError::ConfigError);
        }
        self.local_ip = self.device.gid.to_ip();
        Ok(())
    }

    fn init_memory(&mut self) -> TrafficResult<()> {
        let pd_num = if self.config.share_pd {
            1
        } else {
            self.config.num_of_qps()
        };
        for _ in 0..pd_num {
            self.pds.push(self.verbs.alloc_pd()?);
        }

        let mut buf_size = self.config.buf_size;
        if self.qp_type.is_datagram() {
            buf_size += UD_ADDITION as u32;
        }
        for i in 0..self.config.mr_num {
            let mut region = RdmaRegion::new(buf_size, self.config.buf_num, self.config.memalign);
            region.allocate(&self.verbs, self.get_pd(i), self.config.odp)?;
            self.mempools[PoolSelector::Send as usize]
                .lock()
                .unwrap()
                .push_region(region);
        }
        let mut region = RdmaRegion::new(buf_size, self.config.buf_num, self.config.memalign);
        region.allocate(&self.verbs, self.get_pd(0), self.config.odp)?;
        self.mempools[PoolSelector::Recv as usize]
            .lock()
            .unwrap()
            .push_region(region);

        let cqn = if self.config.share_cq {
            1
        } else {
            self.config.num_of_qps()
        };
        let depth = self.config.cq_depth / cqn as i32;
        for _ in 0..cqn {
            self.send_cqs.push(self.verbs.create_cq(depth)?);
            self.recv_cqs.push(self.verbs.create_cq(depth)?);
        }
        Ok(())
    }

    fn init_transport(&mut self) -> TrafficResult<()> {
        let attr = QpInitAttr {
            qp_type: self.qp_type,
            send_wq_depth: self.config.send_wq_depth,
            recv_wq_depth: self.config.recv_wq_depth,
            max_send_sge: MAX_SGE as u32,
            max_recv_sge: MAX_SGE as u32,
        };
        self.endpoints = (0..self.config.num_of_qps()).map(|_| None).collect();
        for id in 0..self.config.num_of_qps() {
            let (qp, qpn) = self.verbs.create_qp(
                self.get_pd(id),
                self.get_send_cq(id),
                self.get_recv_cq(id),
                &attr,
            )?;
            let ep = RdmaEndpoint::new(
                id,
                qp,
                qpn,
                self.qp_type,
                self.config.gid_idx,
                self.config.send_wq_depth,
                self.config.recv_wq_depth,
                self.verbs.clone(),
            );
            self.endpoints[id] = Some(Arc::new(Mutex::new(ep)));
        }
        info!(
            "transport initialized with {} endpoints",
            self.config.num_of_qps()
        );
        Ok(())
    }

    fn get_pd(&self, i: usize) -> PdHandle {
        self.pds[i % self.pds.len()]
    }

    fn get_send_cq(&self, i: usize) -> CqHandle {
        self.send_cqs[i % self.send_cqs.len()]
    }

    fn get_recv_cq(&self, i: usize) -> CqHandle {
        self.recv_cqs[i % self.recv_cqs.len()]
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    pub fn local_gid(&self) -> Gid {
        self.device.gid
    }

    pub fn lid(&self) -> u16 {
        self.device.lid
    }

    pub fn sl(&self) -> u8 {
        self.device.sl
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn send_cqs(&self) -> &[CqHandle] {
        &self.send_cqs
    }

    pub fn recv_cqs(&self) -> &[CqHandle] {
        &self.recv_cqs
    }

    pub fn verbs(&self) -> &Arc<dyn RdmaVerbs> {
        &self.verbs
    }

    pub fn endpoint(&self, id: usize) -> Option<Arc<Mutex<RdmaEndpoint>>> {
        self.endpoints.get(id).and_then(|ep| ep.clone())
    }

    pub fn endpoints(&self) -> &[Option<Arc<Mutex<RdmaEndpoint>>>] {
        &self.endpoints
    }

    /// Next local buffer of the selected pool; round-robin, wrapping.
    pub fn pick_next(&self, selector: PoolSelector) -> Option<RdmaBuffer> {
        self.mempools[selector as usize].lock().unwrap().pick_next()
    }

    /// Atomically reserve `n` contiguous endpoint ids. On overflow the
    /// counter is left untouched and the request is rejected.
    pub fn reserve_ids(&self, n: usize) -> TrafficResult<usize> {
        let mut num_of_recv = self.num_of_recv.lock().unwrap();
        if *num_of_recv + n > self.config.num_of_qps() {
            error!("QP overflow, request for {} endpoints rejected", n);
            return Err(TrafficError::CapacityExceeded);
        }
        let left = *num_of_recv;
        *num_of_recv += n;
        Ok(left)
    }

    pub fn reserved_ids(&self) -> usize {
        *self.num_of_recv.lock().unwrap()
    }

    /// Append a peer's remote pool; the returned index is its mem_id.
    pub fn append_remote_pool(&self, buffers: Vec<RdmaBuffer>) -> usize {
        let mut pools = self.remote_mempools.lock().unwrap();
        pools.push(buffers);
        pools.len() - 1
    }

    pub fn remote_pool(&self, mem_id: usize) -> Option<Vec<RdmaBuffer>> {
        self.remote_mempools.lock().unwrap().get(mem_id).cloned()
    }

    pub fn push_latency(&self, micros: u64) {
        self.latency.lock().unwrap().push(micros);
    }

    pub fn take_latency(&self) -> Vec<u64> {
        std::mem::take(&mut self.latency.lock().unwrap())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}
