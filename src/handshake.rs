use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::context::RdmaContext;
use crate::endpoint::RdmaEndpoint;
use crate::memory::{PoolSelector, RdmaBuffer};
use crate::msg::{read_info, write_info, ChannelInfo, ConnectInfo, MemInfo};
use crate::request::parse_receives;
use crate::{TrafficError, TrafficResult, MAX_CONN_RETRY};

// The rendezvous protocol. One TCP connection per peer, a strict
// alternating sequence of fixed-size records, closed once traffic can
// flow over the RDMA transport itself.
impl RdmaContext {
    fn set_endpoint_info(&self, ep: &mut RdmaEndpoint, info: &ChannelInfo) {
        if ep.qp_type().is_datagram() {
            ep.set_remote_path(info.lid as u16, info.sl as u8);
        }
        ep.set_remote_qpn(info.qp_num);
    }

    fn get_endpoint_info(&self, ep: &RdmaEndpoint) -> ChannelInfo {
        let mut info = ChannelInfo {
            qp_num: ep.qpn(),
            lid: 0,
            sl: 0,
        };
        if ep.qp_type().is_datagram() {
            info.lid = self.lid() as u32;
            info.sl = self.sl() as u32;
        }
        info
    }

    fn buffer_from_info(info: &MemInfo) -> RdmaBuffer {
        RdmaBuffer::new(info.remote_addr, info.size, 0, info.rkey)
    }

    fn info_from_buffer(buf: &RdmaBuffer) -> MemInfo {
        MemInfo {
            remote_addr: buf.addr,
            rkey: buf.rkey,
            size: buf.size,
        }
    }

    /// The server accept loop: one detached handler thread per inbound
    /// connection. Never returns in normal operation.
    pub fn listen(self: &Arc<Self>) -> TrafficResult<()> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.config().port)).map_err(|e| {
                error!("couldn't listen to port {}: {}", self.config().port, e);
                TrafficError::SocketError
            })?;
        info!("server listen thread starts on port {}", self.config().port);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let ctx = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = ctx.accept_handler(stream) {
                            error!("accept handler failed: {:?}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        }
        Err(TrafficError::SocketError)
    }

    /// Server side of one peer's handshake. Any failure aborts only this
    /// peer: the socket drops, already-activated endpoints stay as they
    /// are, other connections are unaffected.
    pub fn accept_handler(&self, mut stream: TcpStream) -> TrafficResult<()> {
        let mut reqs = parse_receives(&self.config().receive)?;

        let (number_of_qp, number_of_mem, remote_gid) = match read_info(&mut stream)? {
            ConnectInfo::Host(host) => (
                host.number_of_qp as usize,
                host.number_of_mem as usize,
                host.gid(),
            ),
            other => {
                error!("the first exchange should be host info, got {:?}", other);
                return Err(TrafficError::ProtocolError);
            }
        };
        if number_of_qp == 0 {
            error!("the number of qp should be positive");
            return Err(TrafficError::ProtocolError);
        }

        let left = match self.reserve_ids(number_of_qp) {
            Ok(left) => left,
            Err(e) => {
                // the one rejection that answers before closing
                write_info(&mut stream, &ConnectInfo::Reject)?;
                return Err(e);
            }
        };
        let right = left + number_of_qp;

        write_info(
            &mut stream,
            &ConnectInfo::host(self.local_gid(), number_of_qp as u32, 0),
        )?;

        // Ping-pong one remote descriptor against one local descriptor,
        // strictly alternating.
        let mut buffers: Vec<RdmaBuffer> = Vec::with_capacity(number_of_mem);
        for i in 0..number_of_mem {
            let remote_buf = match read_info(&mut stream)? {
                ConnectInfo::Mem(mem) => Self::buffer_from_info(&mem),
                other => {
                    error!("exchange of mem info {} failed, got {:?}", i, other);
                    return Err(TrafficError::ProtocolError);
                }
            };
            buffers.push(remote_buf);
            let buf = self.pick_next(PoolSelector::Recv).ok_or_else(|| {
                error!("server using buffer error");
                TrafficError::ConfigError
            })?;
            write_info(&mut stream, &ConnectInfo::Mem(Self::info_from_buffer(&buf)))?;
        }

        let rbuf_id = self.append_remote_pool(buffers);

        for id in left..right {
            let ep = self.endpoint(id).ok_or(TrafficError::ProtocolError)?;
            let mut ep = ep.lock().unwrap();
            match read_info(&mut stream)? {
                ConnectInfo::Channel(channel) => self.set_endpoint_info(&mut ep, &channel),
                other => {
                    error!("exchange of endpoint {} info failed, got {:?}", id, other);
                    return Err(TrafficError::ProtocolError);
                }
            }
            write_info(
                &mut stream,
                &ConnectInfo::Channel(self.get_endpoint_info(&ep)),
            )?;
            if ep.activate(remote_gid).is_err() {
                error!("activate recv endpoint {} failed", id);
                return Err(TrafficError::ActivateError);
            }
            // Post the first batch up to the full queue depth.
            if self.config().recv_batch > 0 {
                let mut idx = 0usize;
                let batch_size = self.config().recv_batch as i32;
                let mut first_batch = self.config().recv_wq_depth as i32;
                while ep.recv_credits() > 0 && first_batch > 0 {
                    let to_post = first_batch.min(batch_size);
                    for req in reqs.iter_mut() {
                        for sge in req.sgl.iter_mut() {
                            let buf = self.pick_next(PoolSelector::Recv).ok_or_else(|| {
                                error!("server using buffer error");
                                TrafficError::ConfigError
                            })?;
                            sge.addr = buf.addr;
                            sge.lkey = buf.lkey;
                        }
                    }
                    if let Err(e) = ep.post_recv(&reqs, &mut idx, to_post as u32) {
                        error!("the {} receiver post first batch error", id);
                        return Err(e);
                    }
                    first_batch -= to_post;
                }
            }
            ep.set_activated(true);
            ep.set_mem_id(rbuf_id);
            ep.set_server(remote_gid.to_ip());
            info!("endpoint {} has started", id);
        }

        // After connection setup, tell the remote they can send.
        match read_info(&mut stream)? {
            ConnectInfo::Go => {}
            other => {
                error!("go request failed, got {:?}", other);
                return Err(TrafficError::ProtocolError);
            }
        }
        write_info(&mut stream, &ConnectInfo::Go)?;
        Ok(())
    }

    fn connection_setup(server: &str, port: u16) -> TrafficResult<TcpStream> {
        TcpStream::connect((server, port)).map_err(|e| {
            error!("couldn't connect to {}:{}: {}", server, port, e);
            TrafficError::SocketError
        })
    }

    /// Client side: drive the same sequence for the pre-assigned id range
    /// `[connid*per_host, (connid+1)*per_host)`. Only the TCP connect is
    /// retried, with a fixed one-second backoff.
    pub fn connect(&self, server: &str, port: u16, connid: usize) -> TrafficResult<()> {
        let mut stream = None;
        for i in 0..MAX_CONN_RETRY {
            match Self::connection_setup(server, port) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => {
                    info!(
                        "try connect to {}:{} failed for {} times...",
                        server,
                        port,
                        i + 1
                    );
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        let mut stream = stream.ok_or(TrafficError::SocketError)?;

        let per_host = self.config().qp_num;
        write_info(
            &mut stream,
            &ConnectInfo::host(
                self.local_gid(),
                per_host as u32,
                self.config().buf_num as u32,
            ),
        )?;
        let remote_gid = match read_info(&mut stream)? {
            ConnectInfo::Host(host) => {
                if host.number_of_qp as usize != per_host {
                    error!("receiver does not support {} senders", per_host);
                    return Err(TrafficError::ProtocolError);
                }
                host.gid()
            }
            ConnectInfo::Reject => {
                error!("receiver rejected the request, capacity exceeded");
                return Err(TrafficError::CapacityExceeded);
            }
            other => {
                error!("the first exchange should be host info, got {:?}", other);
                return Err(TrafficError::ProtocolError);
            }
        };

        let mut buffers: Vec<RdmaBuffer> = Vec::with_capacity(self.config().buf_num);
        for i in 0..self.config().buf_num {
            let buf = self.pick_next(PoolSelector::Recv).ok_or_else(|| {
                error!("client using buffer error");
                TrafficError::ConfigError
            })?;
            write_info(&mut stream, &ConnectInfo::Mem(Self::info_from_buffer(&buf)))?;
            match read_info(&mut stream)? {
                ConnectInfo::Mem(mem) => buffers.push(Self::buffer_from_info(&mem)),
                other => {
                    error!("exchange of mem info {} failed, got {:?}", i, other);
                    return Err(TrafficError::ProtocolError);
                }
            }
        }

        let rbuf_id = self.append_remote_pool(buffers);

        for i in 0..per_host {
            let id = connid * per_host + i;
            let ep = self.endpoint(id).ok_or(TrafficError::ProtocolError)?;
            let mut ep = ep.lock().unwrap();
            write_info(
                &mut stream,
                &ConnectInfo::Channel(self.get_endpoint_info(&ep)),
            )?;
            match read_info(&mut stream)? {
                ConnectInfo::Channel(channel) => self.set_endpoint_info(&mut ep, &channel),
                other => {
                    error!("exchange of endpoint {} info failed, got {:?}", id, other);
                    return Err(TrafficError::ProtocolError);
                }
            }
            if ep.activate(remote_gid).is_err() {
                error!("activate endpoint {} failed", id);
                return Err(TrafficError::ActivateError);
            }
        }

        write_info(&mut stream, &ConnectInfo::Go)?;
        match read_info(&mut stream)? {
            ConnectInfo::Go => {}
            other => {
                error!("ask to send failed, receiver replied with {:?}", other);
                return Err(TrafficError::ProtocolError);
            }
        }

        for i in 0..per_host {
            let id = connid * per_host + i;
            let ep = self.endpoint(id).ok_or(TrafficError::ProtocolError)?;
            let mut ep = ep.lock().unwrap();
            ep.set_activated(true);
            ep.set_server(remote_gid.to_ip());
            ep.set_mem_id(rbuf_id);
        }
        Ok(())
    }
}
