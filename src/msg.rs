use std::io::{Read, Write};

use byte_struct::*;
use log::error;

use crate::verbs::Gid;
use crate::{TrafficError, TrafficResult};

// Tags of the rendezvous records. Tag 0 doubles as the rejection reply:
// a peer that cannot take the request answers with an all-zero message.
pub mod connect_info_type {
    pub type Type = u32;
    pub const REJECT: Type = 0;
    pub const HOST: Type = 1;
    pub const MEM: Type = 2;
    pub const CHANNEL: Type = 3;
    pub const GO: Type = 4;
}

#[derive(ByteStruct, Clone, Copy, PartialEq, Default, Debug)]
#[byte_struct_be]
pub struct HostInfo {
    // the 16 raw gid bytes as two big-endian words
    pub gid_hi: u64,
    pub gid_lo: u64,
    pub number_of_qp: u32,
    pub number_of_mem: u32,
}

impl HostInfo {
    pub fn gid(&self) -> Gid {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&self.gid_hi.to_be_bytes());
        raw[8..16].copy_from_slice(&self.gid_lo.to_be_bytes());
        Gid { raw }
    }
}

#[derive(ByteStruct, Clone, Copy, PartialEq, Default, Debug)]
#[byte_struct_be]
pub struct MemInfo {
    pub remote_addr: u64,
    pub rkey: u32,
    pub size: u32,
}

#[derive(ByteStruct, Clone, Copy, PartialEq, Default, Debug)]
#[byte_struct_be]
pub struct ChannelInfo {
    pub qp_num: u32,
    pub lid: u32,
    pub sl: u32,
}

// The payload area fits the largest variant; the record size is fixed so
// each message is exactly one read/write of CONNECT_INFO_BYTES.
const INFO_PAYLOAD: usize = 24;
pub const CONNECT_INFO_BYTES: usize = 4 + INFO_PAYLOAD;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ConnectInfo {
    Reject,
    Host(HostInfo),
    Mem(MemInfo),
    Channel(ChannelInfo),
    Go,
}

impl ConnectInfo {
    pub fn host(gid: Gid, number_of_qp: u32, number_of_mem: u32) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&gid.raw[0..8]);
        lo.copy_from_slice(&gid.raw[8..16]);
        ConnectInfo::Host(HostInfo {
            gid_hi: u64::from_be_bytes(hi),
            gid_lo: u64::from_be_bytes(lo),
            number_of_qp,
            number_of_mem,
        })
    }

    pub fn encode(&self) -> [u8; CONNECT_INFO_BYTES] {
        let mut buf = [0u8; CONNECT_INFO_BYTES];
        let tag = match self {
            ConnectInfo::Reject => connect_info_type::REJECT,
            ConnectInfo::Host(_) => connect_info_type::HOST,
            ConnectInfo::Mem(_) => connect_info_type::MEM,
            ConnectInfo::Channel(_) => connect_info_type::CHANNEL,
            ConnectInfo::Go => connect_info_type::GO,
        };
        buf[0..4].copy_from_slice(&tag.to_be_bytes());
        match self {
            ConnectInfo::Host(info) => info.write_bytes(&mut buf[4..4 + HostInfo::BYTE_LEN]),
            ConnectInfo::Mem(info) => info.write_bytes(&mut buf[4..4 + MemInfo::BYTE_LEN]),
            ConnectInfo::Channel(info) => {
                info.write_bytes(&mut buf[4..4 + ChannelInfo::BYTE_LEN])
            }
            ConnectInfo::Reject | ConnectInfo::Go => {}
        }
        buf
    }

    pub fn decode(buf: &[u8; CONNECT_INFO_BYTES]) -> TrafficResult<Self> {
        let tag = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match tag {
            connect_info_type::REJECT => Ok(ConnectInfo::Reject),
            connect_info_type::HOST => Ok(ConnectInfo::Host(HostInfo::read_bytes(
                &buf[4..4 + HostInfo::BYTE_LEN],
            ))),
            connect_info_type::MEM => Ok(ConnectInfo::Mem(MemInfo::read_bytes(
                &buf[4..4 + MemInfo::BYTE_LEN],
            ))),
            connect_info_type::CHANNEL => Ok(ConnectInfo::Channel(ChannelInfo::read_bytes(
                &buf[4..4 + ChannelInfo::BYTE_LEN],
            ))),
            connect_info_type::GO => Ok(ConnectInfo::Go),
            _ => {
                error!("unknown connect_info type {}", tag);
                Err(TrafficError::ProtocolError)
            }
        }
    }
}

/// One message is exactly one read of the fixed record size; anything
/// shorter is a protocol error, there is no partial-message reassembly.
pub fn read_info<R: Read>(stream: &mut R) -> TrafficResult<ConnectInfo> {
    let mut buf = [0u8; CONNECT_INFO_BYTES];
    let n = stream.read(&mut buf).map_err(|e| {
        error!("connect_info read failed: {}", e);
        TrafficError::SocketError
    })?;
    if n != CONNECT_INFO_BYTES {
        error!("{}/{}: short connect_info read", n, CONNECT_INFO_BYTES);
        return Err(TrafficError::ProtocolError);
    }
    ConnectInfo::decode(&buf)
}

pub fn write_info<W: Write>(stream: &mut W, info: &ConnectInfo) -> TrafficResult<()> {
    let buf = info.encode();
    let n = stream.write(&buf).map_err(|e| {
        error!("connect_info write failed: {}", e);
        TrafficError::SocketError
    })?;
    if n != CONNECT_INFO_BYTES {
        error!("{}/{}: short connect_info write", n, CONNECT_INFO_BYTES);
        return Err(TrafficError::ProtocolError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_info_round_trip() {
        let mut gid = Gid::default();
        gid.raw[15] = 9;
        let info = ConnectInfo::host(gid, 4, 2);
        let decoded = ConnectInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn mem_info_round_trip() {
        let info = ConnectInfo::Mem(MemInfo {
            remote_addr: 0xdead_beef_0000_1234,
            rkey: 0x77,
            size: 65536,
        });
        assert_eq!(ConnectInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn channel_info_round_trip() {
        let info = ConnectInfo::Channel(ChannelInfo {
            qp_num: 1077,
            lid: 3,
            sl: 1,
        });
        assert_eq!(ConnectInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn zeroed_message_is_a_rejection() {
        let buf = [0u8; CONNECT_INFO_BYTES];
        assert_eq!(ConnectInfo::decode(&buf).unwrap(), ConnectInfo::Reject);
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut buf = [0u8; CONNECT_INFO_BYTES];
        buf[0..4].copy_from_slice(&99u32.to_be_bytes());
        assert_eq!(
            ConnectInfo::decode(&buf),
            Err(TrafficError::ProtocolError)
        );
    }

    #[test]
    fn fields_travel_in_network_byte_order() {
        let info = ConnectInfo::Channel(ChannelInfo {
            qp_num: 0x0102_0304,
            lid: 0,
            sl: 0,
        });
        let buf = info.encode();
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
    }
}
