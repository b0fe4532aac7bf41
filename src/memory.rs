use std::sync::Arc;

use libc::{free, malloc, memalign, sysconf, _SC_PAGESIZE};
use log::error;

use crate::verbs::{PdHandle, RdmaVerbs};
use crate::{TrafficError, TrafficResult};

/// One slice of a registered region. Value-copied freely; the region owns
/// the memory, remote pools carry only the metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdmaBuffer {
    pub addr: u64,
    pub size: u32,
    pub lkey: u32,
    pub rkey: u32,
}

impl RdmaBuffer {
    pub fn new(addr: u64, size: u32, lkey: u32, rkey: u32) -> Self {
        Self {
            addr,
            size,
            lkey,
            rkey,
        }
    }
}

/// One contiguous allocation registered with the device and split into
/// `num` equal buffers, handed out round-robin.
pub struct RdmaRegion {
    backing: *mut u8,
    num: usize,
    size: u32,
    align: bool,
    ret_idx: usize,
    buffers: Vec<RdmaBuffer>,
}

unsafe impl Send for RdmaRegion {}

impl RdmaRegion {
    pub fn new(size: u32, num: usize, align: bool) -> Self {
        Self {
            backing: std::ptr::null_mut(),
            num,
            size,
            align,
            ret_idx: 0,
            buffers: Vec::new(),
        }
    }

    pub fn allocate(
        &mut self,
        verbs: &Arc<dyn RdmaVerbs>,
        pd: PdHandle,
        odp: bool,
    ) -> TrafficResult<()> {
        let total = self.num * self.size as usize;
        let buffer = if self.align {
            unsafe { memalign(sysconf(_SC_PAGESIZE) as usize, total) }
        } else {
            unsafe { malloc(total) }
        };
        if buffer.is_null() {
            error!("region memory allocation of {} bytes failed", total);
            return Err(TrafficError::TransportError);
        }
        let mr = match verbs.reg_mr(pd, buffer as u64, total, odp) {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { free(buffer) };
                error!("reg_mr() failed for region of {} bytes", total);
                return Err(e);
            }
        };
        self.backing = buffer as *mut u8;
        for i in 0..self.num {
            self.buffers.push(RdmaBuffer::new(
                buffer as u64 + (self.size as u64) * i as u64,
                self.size,
                mr.lkey,
                mr.rkey,
            ));
        }
        Ok(())
    }

    /// Next buffer in FIFO order, wrapping at the end.
    pub fn get_buffer(&mut self) -> Option<RdmaBuffer> {
        if self.buffers.is_empty() {
            error!("the region's buffer list is empty");
            return None;
        }
        let buf = self.buffers[self.ret_idx];
        self.ret_idx += 1;
        if self.ret_idx == self.buffers.len() {
            self.ret_idx = 0;
        }
        Some(buf)
    }

    // true right after the cursor wrapped back to the first buffer
    fn wrapped(&self) -> bool {
        self.ret_idx == 0
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for RdmaRegion {
    fn drop(&mut self) {
        if !self.backing.is_null() {
            unsafe { free(self.backing as *mut _) };
        }
    }
}

/// Which of the two local pools a caller rotates over.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolSelector {
    Recv = 0,
    Send = 1,
}

/// A ring of regions; serves the current region until its inner cursor
/// wraps, then moves to the next region. Callers serialize externally.
pub struct BufferPool {
    regions: Vec<RdmaRegion>,
    region_idx: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            region_idx: 0,
        }
    }

    pub fn push_region(&mut self, region: RdmaRegion) {
        self.regions.push(region);
    }

    pub fn pick_next(&mut self) -> Option<RdmaBuffer> {
        if self.regions.is_empty() {
            error!("pick_next() on a pool with no regions");
            return None;
        }
        let idx = self.region_idx;
        let buf = self.regions[idx].get_buffer()?;
        if self.regions[idx].wrapped() {
            self.region_idx = (idx + 1) % self.regions.len();
        }
        Some(buf)
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::sim::SimVerbs;

    fn pool_with(verbs: &Arc<dyn RdmaVerbs>, regions: usize, bufs: usize) -> BufferPool {
        let pd = verbs.alloc_pd().unwrap();
        let mut pool = BufferPool::new();
        for _ in 0..regions {
            let mut region = RdmaRegion::new(64, bufs, true);
            region.allocate(verbs, pd, false).unwrap();
            pool.push_region(region);
        }
        pool
    }

    #[test]
    fn full_cycle_wraps_to_first_buffer() {
        let verbs: Arc<dyn RdmaVerbs> = Arc::new(SimVerbs::new());
        let mut pool = pool_with(&verbs, 3, 4);
        let first = pool.pick_next().unwrap();
        for _ in 0..(3 * 4 - 1) {
            let buf = pool.pick_next().unwrap();
            assert_ne!(buf.addr, first.addr);
        }
        // the (R*B+1)-th call returns the first buffer again
        assert_eq!(pool.pick_next().unwrap(), first);
    }

    #[test]
    fn empty_pool_returns_none() {
        let mut pool = BufferPool::new();
        assert!(pool.pick_next().is_none());
    }

    #[test]
    fn single_region_cycles_in_order() {
        let verbs: Arc<dyn RdmaVerbs> = Arc::new(SimVerbs::new());
        let mut pool = pool_with(&verbs, 1, 4);
        let round: Vec<u64> = (0..4).map(|_| pool.pick_next().unwrap().addr).collect();
        assert!(round.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(pool.pick_next().unwrap().addr, round[0]);
    }
}
