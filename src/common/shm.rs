use std::thread;
use std::time::Duration;

use errno::errno;
use libc::{c_void, shmat, shmdt, shmget, IPC_CREAT};
use log::{error, info};

use crate::{TrafficError, TrafficResult};

// The word the victim publishes once it is ready, and the phase values
// the coordinator writes afterwards.
const SHM_VICTIM_READY: i32 = 0xdeadbeef_u32 as i32;
const SHM_START: i32 = 0;
const SHM_PHASE1: i32 = 1;
const SHM_PHASE2: i32 = 2;
const SHM_PHASE3: i32 = 3;

// running seconds before the first phase
const START_SECS: u64 = 4;

/// Victim-side phase reporter. Attaches the coordinator's shared memory
/// segment, publishes readiness, then prints a `-1,-1` boundary marker
/// on every phase transition so the throughput stream can be split.
pub fn set_shm_thread(key: i32) -> TrafficResult<()> {
    let shmid = unsafe { shmget(key, std::mem::size_of::<i32>(), 0o666 | IPC_CREAT) };
    if shmid < 0 {
        error!("shmget failed, errno = {}", errno());
        return Err(TrafficError::ConfigError);
    }
    let shm = unsafe { shmat(shmid, std::ptr::null(), 0) };
    if shm == -1isize as *mut c_void {
        error!("shmat failed, errno = {}", errno());
        return Err(TrafficError::ConfigError);
    }
    info!("shared memory created, attached at {:?}", shm);
    thread::sleep(Duration::from_millis(START_SECS * 2000));

    let ipc_val = shm as *mut i32;
    unsafe { std::ptr::write_volatile(ipc_val, SHM_VICTIM_READY) };
    let mut last_val = SHM_VICTIM_READY;
    loop {
        let val = unsafe { std::ptr::read_volatile(ipc_val) };
        if val != last_val {
            last_val = val;
            match val {
                SHM_START => {
                    info!("======================   start   ===========================");
                    println!("-1,-1");
                }
                SHM_PHASE1 => {
                    info!("===================== Phase 1 ends =========================");
                    println!("-1,-1");
                }
                SHM_PHASE2 => {
                    info!("===================== Phase 2 ends =========================");
                    println!("-1,-1");
                }
                SHM_PHASE3 => {
                    info!("===================== Phase 3 ends =========================");
                    println!("-1,-1");
                }
                _ => {
                    error!("unexpected phase value {} in shared memory", val);
                    unsafe { shmdt(shm) };
                    return Err(TrafficError::ProtocolError);
                }
            }
        }
        if last_val == SHM_PHASE3 {
            unsafe { shmdt(shm) };
            // test over, give the datapath a moment before the process exits
            thread::sleep(Duration::from_millis(7000));
            return Ok(());
        }
    }
}
