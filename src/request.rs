use log::error;

use crate::verbs::{Opcode, QpType, Sge};
use crate::{TrafficError, TrafficResult, MAX_SGE};

/// A work-request template. The scatter-gather lengths come from the
/// textual template at startup; addr/lkey are rewritten from freshly
/// picked buffers on every posting cycle by the thread that owns it.
#[derive(Clone, Debug)]
pub struct RdmaRequest {
    pub opcode: Opcode,
    pub sgl: Vec<Sge>,
}

fn parse_sges(fields: &[&str], sge_num: usize) -> TrafficResult<Vec<Sge>> {
    if sge_num == 0 || sge_num > MAX_SGE {
        error!("a request must carry 1..={} SGEs, got {}", MAX_SGE, sge_num);
        return Err(TrafficError::ConfigError);
    }
    if fields.len() != sge_num {
        error!(
            "template declares {} SGEs but lists {} lengths",
            sge_num,
            fields.len()
        );
        return Err(TrafficError::ConfigError);
    }
    let mut sgl = Vec::with_capacity(sge_num);
    for f in fields {
        let length: u32 = f.parse().map_err(|_| {
            error!("bad SGE length \"{}\" in template", f);
            TrafficError::ConfigError
        })?;
        sgl.push(Sge {
            addr: 0,
            length,
            lkey: 0,
        });
    }
    Ok(sgl)
}

/// Request template mini-language: `op:sge_count:len[:len...]`, requests
/// separated by commas. op is one of w/r/s/f/c.
pub fn parse_requests(
    template: &str,
    qp_type: QpType,
    imm_data: bool,
) -> TrafficResult<Vec<RdmaRequest>> {
    let mut requests = Vec::new();
    for part in template.split(',').filter(|p| !p.is_empty()) {
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() < 3 {
            error!("bad request template \"{}\"", part);
            return Err(TrafficError::ConfigError);
        }
        let op = fields[0];
        if op != "s" && qp_type.is_datagram() {
            error!("UD does not support opcode other than SEND/RECV");
            return Err(TrafficError::ConfigError);
        }
        if op == "r" && qp_type != QpType::Rc {
            error!("only RC supports RDMA Read");
            return Err(TrafficError::ConfigError);
        }
        let opcode = match op {
            "w" => {
                if imm_data {
                    Opcode::WriteImm
                } else {
                    Opcode::Write
                }
            }
            "r" => Opcode::Read,
            "s" => Opcode::Send,
            "f" => Opcode::FetchAdd,
            "c" => Opcode::CmpSwap,
            _ => {
                error!("unsupported work request opcode \"{}\"", op);
                return Err(TrafficError::ConfigError);
            }
        };
        let sge_num: usize = fields[1].parse().map_err(|_| {
            error!("bad SGE count \"{}\" in template", fields[1]);
            TrafficError::ConfigError
        })?;
        requests.push(RdmaRequest {
            opcode,
            sgl: parse_sges(&fields[2..], sge_num)?,
        });
    }
    if requests.is_empty() {
        error!("empty request template");
        return Err(TrafficError::ConfigError);
    }
    Ok(requests)
}

/// Receive templates carry no opcode: `sge_count:len[:len...]`.
pub fn parse_receives(template: &str) -> TrafficResult<Vec<RdmaRequest>> {
    let mut requests = Vec::new();
    for part in template.split(',').filter(|p| !p.is_empty()) {
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() < 2 {
            error!("bad receive template \"{}\"", part);
            return Err(TrafficError::ConfigError);
        }
        let sge_num: usize = fields[0].parse().map_err(|_| {
            error!("bad SGE count \"{}\" in template", fields[0]);
            TrafficError::ConfigError
        })?;
        requests.push(RdmaRequest {
            opcode: Opcode::Send,
            sgl: parse_sges(&fields[1..], sge_num)?,
        });
    }
    if requests.is_empty() {
        error!("empty receive template");
        return Err(TrafficError::ConfigError);
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_write() {
        let reqs = parse_requests("w:1:64", QpType::Rc, false).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].opcode, Opcode::Write);
        assert_eq!(reqs[0].sgl.len(), 1);
        assert_eq!(reqs[0].sgl[0].length, 64);
    }

    #[test]
    fn parses_request_sequence() {
        let reqs = parse_requests("s:2:128:256,r:1:1024", QpType::Rc, false).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].opcode, Opcode::Send);
        assert_eq!(reqs[0].sgl[1].length, 256);
        assert_eq!(reqs[1].opcode, Opcode::Read);
    }

    #[test]
    fn imm_data_upgrades_writes() {
        let reqs = parse_requests("w:1:64", QpType::Rc, true).unwrap();
        assert_eq!(reqs[0].opcode, Opcode::WriteImm);
    }

    #[test]
    fn ud_rejects_one_sided_opcodes() {
        assert!(parse_requests("w:1:64", QpType::Ud, false).is_err());
        assert!(parse_requests("s:1:64", QpType::Ud, false).is_ok());
    }

    #[test]
    fn read_requires_rc() {
        assert!(parse_requests("r:1:64", QpType::Uc, false).is_err());
    }

    #[test]
    fn parses_receive_template() {
        let reqs = parse_receives("1:64,2:32:32").unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].sgl.len(), 2);
    }

    #[test]
    fn sge_count_mismatch_is_an_error() {
        assert!(parse_requests("w:2:64", QpType::Rc, false).is_err());
    }
}
