use clap::{App, Arg, ArgMatches};
use log::error;
use serde_derive::{Deserialize, Serialize};

use crate::verbs::QpType;
use crate::{TrafficError, TrafficResult};

/// The whole configuration surface of the engine, mirroring the flag set
/// of the traffic generator. Loadable from the command line or from a
/// JSON file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub dev: String,
    pub gid_idx: i32,
    /// run the server (receiver) side
    pub server: bool,
    /// comma-separated hosts to connect to; empty for server-only
    pub connect: String,
    pub port: u16,
    pub host_num: usize,
    /// queue pairs per host
    pub qp_num: usize,
    /// 2 = RC, 3 = UC, 4 = UD
    pub qp_type: i32,
    pub mr_num: usize,
    pub buf_num: usize,
    pub buf_size: u32,
    pub memalign: bool,
    pub odp: bool,
    pub send_wq_depth: u32,
    pub recv_wq_depth: u32,
    pub cq_depth: i32,
    pub share_pd: bool,
    pub share_cq: bool,
    pub send_batch: u32,
    pub recv_batch: u32,
    pub iters: i64,
    pub run_infinitely: bool,
    pub request: String,
    pub receive: String,
    pub imm_data: bool,
    pub print_thp: bool,
    /// run with the phase reporter attached (the isolation harness)
    pub ctrl: bool,
    pub shm_key: i32,
    pub thread: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev: "mlx5_0".to_string(),
            gid_idx: 1,
            server: false,
            connect: String::new(),
            port: 12000,
            host_num: 1,
            qp_num: 1,
            qp_type: 2,
            mr_num: 1,
            buf_num: 16,
            buf_size: 65536,
            memalign: true,
            odp: false,
            send_wq_depth: 128,
            recv_wq_depth: 128,
            cq_depth: 1024,
            share_pd: true,
            share_cq: true,
            send_batch: 32,
            recv_batch: 32,
            iters: 1_000_000,
            run_infinitely: false,
            request: "w:1:65536".to_string(),
            receive: "1:65536".to_string(),
            imm_data: false,
            print_thp: false,
            ctrl: false,
            shm_key: 0x2022_0222,
            thread: 1,
        }
    }
}

fn value_arg(name: &'static str, help: &'static str) -> Arg<'static> {
    Arg::new(name).long(name).takes_value(true).help(help)
}

impl Config {
    pub fn app() -> App<'static> {
        App::new("traffic")
            .about("RDMA traffic engine")
            .arg(value_arg("dev", "The IB device to use"))
            .arg(value_arg("gid", "The GID index to use"))
            .arg(Arg::new("server").long("server").help("Run the server side"))
            .arg(value_arg("connect", "Comma-separated hosts to connect to"))
            .arg(value_arg("port", "The TCP port of the rendezvous channel"))
            .arg(value_arg("host_num", "Number of peer hosts"))
            .arg(value_arg("qp_num", "Queue pairs per host"))
            .arg(value_arg("qp_type", "QP type: 2 for RC, 3 for UC, 4 for UD"))
            .arg(value_arg("mr_num", "Number of regions in the send pool"))
            .arg(value_arg("buf_num", "Buffers per region"))
            .arg(value_arg("buf_size", "Size of each buffer"))
            .arg(value_arg("memalign", "memalign instead of malloc (true/false)"))
            .arg(value_arg("odp", "Register memory on-demand (true/false)"))
            .arg(value_arg("send_wq_depth", "Send work queue depth"))
            .arg(value_arg("recv_wq_depth", "Recv work queue depth"))
            .arg(value_arg("cq_depth", "Total completion queue depth"))
            .arg(value_arg("share_pd", "All QPs share one PD (true/false)"))
            .arg(value_arg("share_cq", "All QPs share one CQ pair (true/false)"))
            .arg(value_arg("send_batch", "Send work requests per post"))
            .arg(value_arg("recv_batch", "Recv work requests per post"))
            .arg(value_arg("iters", "Iteration budget for the client loop"))
            .arg(Arg::new("run_infinitely").long("run_infinitely").help("Ignore the iteration budget"))
            .arg(value_arg("request", "Request template, e.g. w:1:65536"))
            .arg(value_arg("receive", "Receive template, e.g. 1:65536"))
            .arg(Arg::new("imm_data").long("imm_data").help("Writes carry immediate data"))
            .arg(Arg::new("print_thp").long("print_thp").help("Log throughput once per second"))
            .arg(Arg::new("ctrl").long("ctrl").help("Enable for control test"))
            .arg(value_arg("shm_key", "Shared memory key for phase signaling"))
            .arg(value_arg("thread", "Client context threads"))
            .arg(value_arg("config", "Load settings from a JSON file first"))
    }

    fn set_str(field: &mut String, matches: &ArgMatches, name: &str) {
        if let Some(v) = matches.value_of(name) {
            *field = v.to_string();
        }
    }

    fn set_parse<T: std::str::FromStr>(field: &mut T, matches: &ArgMatches, name: &str) {
        if let Some(v) = matches.value_of(name) {
            if let Ok(parsed) = v.parse::<T>() {
                *field = parsed;
            } else {
                error!("ignoring unparsable value \"{}\" for --{}", v, name);
            }
        }
    }

    pub fn from_matches(matches: &ArgMatches) -> TrafficResult<Self> {
        let mut config = match matches.value_of("config") {
            Some(path) => Self::from_json(path)?,
            None => Self::default(),
        };
        Self::set_str(&mut config.dev, matches, "dev");
        Self::set_parse(&mut config.gid_idx, matches, "gid");
        if matches.is_present("server") {
            config.server = true;
        }
        Self::set_str(&mut config.connect, matches, "connect");
        Self::set_parse(&mut config.port, matches, "port");
        Self::set_parse(&mut config.host_num, matches, "host_num");
        Self::set_parse(&mut config.qp_num, matches, "qp_num");
        Self::set_parse(&mut config.qp_type, matches, "qp_type");
        Self::set_parse(&mut config.mr_num, matches, "mr_num");
        Self::set_parse(&mut config.buf_num, matches, "buf_num");
        Self::set_parse(&mut config.buf_size, matches, "buf_size");
        Self::set_parse(&mut config.memalign, matches, "memalign");
        Self::set_parse(&mut config.odp, matches, "odp");
        Self::set_parse(&mut config.send_wq_depth, matches, "send_wq_depth");
        Self::set_parse(&mut config.recv_wq_depth, matches, "recv_wq_depth");
        Self::set_parse(&mut config.cq_depth, matches, "cq_depth");
        Self::set_parse(&mut config.share_pd, matches, "share_pd");
        Self::set_parse(&mut config.share_cq, matches, "share_cq");
        Self::set_parse(&mut config.send_batch, matches, "send_batch");
        Self::set_parse(&mut config.recv_batch, matches, "recv_batch");
        Self::set_parse(&mut config.iters, matches, "iters");
        if matches.is_present("run_infinitely") {
            config.run_infinitely = true;
        }
        Self::set_str(&mut config.request, matches, "request");
        Self::set_str(&mut config.receive, matches, "receive");
        if matches.is_present("imm_data") {
            config.imm_data = true;
        }
        if matches.is_present("print_thp") {
            config.print_thp = true;
        }
        if matches.is_present("ctrl") {
            config.ctrl = true;
        }
        Self::set_parse(&mut config.shm_key, matches, "shm_key");
        Self::set_parse(&mut config.thread, matches, "thread");
        Ok(config)
    }

    pub fn from_json(path: &str) -> TrafficResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            error!("reading config file {} failed: {}", path, e);
            TrafficError::ConfigError
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            error!("parsing config file {} failed: {}", path, e);
            TrafficError::ConfigError
        })
    }

    pub fn qp_type(&self) -> TrafficResult<QpType> {
        QpType::from_flag(self.qp_type).ok_or_else(|| {
            error!("unsupported qp_type flag {}", self.qp_type);
            TrafficError::ConfigError
        })
    }

    /// Total endpoint capacity of a context.
    pub fn num_of_qps(&self) -> usize {
        self.host_num * self.qp_num
    }

    pub fn host_list(&self) -> Vec<String> {
        self.connect
            .split(',')
            .filter(|h| !h.is_empty())
            .map(|h| h.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.qp_type().unwrap(), QpType::Rc);
        assert_eq!(config.num_of_qps(), 1);
        assert!(config.host_list().is_empty());
    }

    #[test]
    fn cli_overrides_defaults() {
        let matches = Config::app().get_matches_from(vec![
            "traffic",
            "--connect",
            "10.0.0.2,10.0.0.3",
            "--qp_num",
            "4",
            "--host_num",
            "2",
            "--run_infinitely",
        ]);
        let config = Config::from_matches(&matches).unwrap();
        assert_eq!(config.host_list().len(), 2);
        assert_eq!(config.num_of_qps(), 8);
        assert!(config.run_infinitely);
        assert_eq!(config.port, 12000);
    }

    #[test]
    fn json_round_trip() {
        let config = Config::default();
        let data = serde_json::to_vec(&config).unwrap();
        let back: Config = serde_json::from_slice(&data).unwrap();
        assert_eq!(back.buf_size, config.buf_size);
        assert_eq!(back.request, config.request);
    }
}
