use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info};

use crate::common::shm;
use crate::context::RdmaContext;
use crate::memory::{PoolSelector, RdmaBuffer};
use crate::request::{parse_receives, parse_requests};
use crate::verbs::{CqHandle, WC_SUCCESS};
use crate::{TrafficError, TrafficResult, CQ_POLL_DEPTH};

// The steady-state loops. One dedicated thread per context drives these;
// endpoint state is touched by no one else once the handshake is done.
impl RdmaContext {
    /// Drain one completion queue, dispatching each entry to its
    /// endpoint's handler. Loops until a poll comes back empty, so a
    /// burst is fully drained before returning. A completion with bad
    /// status is fatal for the whole process.
    pub fn poll_each(&self, cq: CqHandle) -> TrafficResult<usize> {
        let mut total = 0usize;
        loop {
            let mut comps = Vec::with_capacity(CQ_POLL_DEPTH);
            let n = self.verbs().poll_cq(cq, CQ_POLL_DEPTH, &mut comps)?;
            if n == 0 {
                break;
            }
            for wc in &comps {
                if wc.status != WC_SUCCESS {
                    error!(
                        "got bad completion status {} for endpoint {}",
                        wc.status, wc.wr_id
                    );
                    return Err(TrafficError::CompletionError);
                }
                let ep = self.endpoint(wc.wr_id as usize).ok_or_else(|| {
                    error!("completion for unknown endpoint {}", wc.wr_id);
                    TrafficError::CompletionError
                })?;
                let mut ep = ep.lock().unwrap();
                if wc.opcode.is_recv() {
                    ep.recv_handler(wc);
                } else {
                    let lat = ep.start_time.elapsed().as_micros() as u64;
                    self.push_latency(lat);
                    ep.send_handler(wc);
                }
            }
            total += n;
        }
        Ok(total)
    }

    /// Receiver loop: keep every activated endpoint's receive queue full,
    /// then poll the receive completion queues. Runs until a fatal
    /// completion error or an external stop request.
    pub fn server_datapath(&self) -> TrafficResult<()> {
        let batch_size = self.config().recv_batch as i32;
        let mut reqs = parse_receives(&self.config().receive)?;
        let mut idx = 0usize;
        loop {
            if batch_size > 0 {
                for ep in self.endpoints().iter().flatten() {
                    let mut ep = ep.lock().unwrap();
                    if !ep.activated() || ep.recv_credits() <= 0 {
                        continue;
                    }
                    let mut credits = ep.recv_credits();
                    while credits > 0 {
                        let to_post = credits.min(batch_size);
                        for req in reqs.iter_mut() {
                            for sge in req.sgl.iter_mut() {
                                let buf = self
                                    .pick_next(PoolSelector::Recv)
                                    .ok_or(TrafficError::ConfigError)?;
                                sge.addr = buf.addr;
                                sge.lkey = buf.lkey;
                            }
                        }
                        if ep.post_recv(&reqs, &mut idx, to_post as u32).is_err() {
                            error!("post_recv() failed");
                            break;
                        }
                        credits -= to_post;
                    }
                }
            }
            for cq in self.recv_cqs().to_vec() {
                if let Err(e) = self.poll_each(cq) {
                    error!("poll_each() failed");
                    return Err(e);
                }
            }
            if self.stopped() {
                return Ok(());
            }
        }
    }

    /// Sender loop: post batches against every activated endpoint with
    /// enough credit, poll for completions, optionally sample aggregate
    /// throughput once per second.
    pub fn client_datapath(&self) -> TrafficResult<()> {
        let mut req_vec = parse_requests(
            &self.config().request,
            self.qp_type(),
            self.config().imm_data,
        )?;
        let batch_size = self.config().send_batch;
        let mut j = 0usize;
        let mut iterations_left = self.config().iters;
        let run_infinitely = self.config().run_infinitely;
        let mut last_ts = Instant::now();
        let mut pool_cache: HashMap<usize, Vec<RdmaBuffer>> = HashMap::new();

        loop {
            if !run_infinitely && iterations_left <= 0 {
                break;
            }
            if self.stopped() {
                break;
            }
            for ep in self.endpoints().iter().flatten() {
                let mut ep = ep.lock().unwrap();
                if !ep.activated() {
                    continue;
                }
                if batch_size as i32 > ep.send_credits() {
                    continue;
                }
                // Shuffle the buffers that are used.
                for req in req_vec.iter_mut() {
                    for sge in req.sgl.iter_mut() {
                        let buf = self
                            .pick_next(PoolSelector::Send)
                            .ok_or(TrafficError::ConfigError)?;
                        sge.addr = buf.addr;
                        sge.lkey = buf.lkey;
                    }
                }
                let mem_id = ep.mem_id();
                if !pool_cache.contains_key(&mem_id) {
                    // the remote pool list is append-only, safe to cache
                    pool_cache.insert(mem_id, self.remote_pool(mem_id).unwrap_or_default());
                }
                let remote_pool = &pool_cache[&mem_id];
                let _ = ep.post_send(&req_vec, &mut j, batch_size, remote_pool);
            }
            for cq in self.send_cqs().to_vec() {
                match self.poll_each(cq) {
                    Err(e) => {
                        error!("poll_each() for sender failed");
                        return Err(e);
                    }
                    Ok(n) => {
                        if n > 0 {
                            iterations_left -= 1;
                        }
                    }
                }
            }
            for cq in self.recv_cqs().to_vec() {
                if let Err(e) = self.poll_each(cq) {
                    error!("poll_each() for receiver failed");
                    return Err(e);
                }
            }
            if self.config().print_thp {
                let now = Instant::now();
                if now.duration_since(last_ts) >= Duration::from_secs(1) {
                    let mut sum_bw = 0.0;
                    let mut sum_rate = 0.0;
                    for ep in self.endpoints().iter().flatten() {
                        let mut ep = ep.lock().unwrap();
                        if !ep.activated() {
                            continue;
                        }
                        let (bw, rate) = ep.get_throughput(now);
                        sum_bw += bw;
                        sum_rate += rate;
                    }
                    info!("(Gbps,Mrps) is {},{}", sum_bw, sum_rate);
                    println!("{},{}", sum_bw, sum_rate);
                    last_ts = now;
                }
            }
        }
        for lat in self.take_latency() {
            info!("{}", lat);
        }
        Ok(())
    }

    /// Client loop with the shared-memory phase reporter running
    /// alongside, for the isolation harness.
    pub fn measure_thp(self: &Arc<Self>) -> TrafficResult<()> {
        let key = self.config().shm_key;
        thread::spawn(move || {
            if let Err(e) = shm::set_shm_thread(key) {
                error!("phase reporter failed: {:?}", e);
            }
        });
        self.client_datapath()
    }
}
