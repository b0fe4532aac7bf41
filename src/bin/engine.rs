use std::process::exit;
use std::sync::Arc;
use std::thread;

use log::{error, info};

use traffic::common::logs::init_log;
use traffic::config::Config;
use traffic::context::RdmaContext;
use traffic::verbs::RdmaVerbs;

#[cfg(feature = "verbs")]
fn make_verbs() -> Arc<dyn RdmaVerbs> {
    unsafe { rdma_sys::ibv_fork_init() };
    Arc::new(traffic::verbs::ib::IbvVerbs::new())
}

#[cfg(not(feature = "verbs"))]
fn make_verbs() -> Arc<dyn RdmaVerbs> {
    log::warn!("built without the verbs feature, driving the simulated fabric");
    Arc::new(traffic::verbs::sim::SimVerbs::new())
}

fn main() {
    init_log();
    let matches = Config::app().get_matches();
    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {:?}", e);
            exit(1);
        }
    };

    info!("traffic engine starts");
    if config.server {
        let ctx = match RdmaContext::new(make_verbs(), config) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                error!("server initialization failed: {:?}, exit...", e);
                exit(1);
            }
        };
        let stopper = ctx.clone();
        let _ = ctrlc::set_handler(move || stopper.request_stop());

        let listen_ctx = ctx.clone();
        let listen_thread = thread::spawn(move || {
            let _ = listen_ctx.listen();
        });
        let server_ctx = ctx.clone();
        let server_thread = thread::spawn(move || {
            if server_ctx.server_datapath().is_err() {
                error!("server datapath hit a fatal completion error");
                exit(1);
            }
        });
        info!("server has started");
        let _ = server_thread.join();
        let _ = listen_thread.join();
        return;
    }

    if !config.connect.is_empty() {
        let host_vec = config.host_list();
        let mut clients = Vec::new();
        for _ in 0..config.thread {
            let mut client_config = config.clone();
            client_config.host_num = host_vec.len();
            let ctx = match RdmaContext::new(make_verbs(), client_config) {
                Ok(ctx) => Arc::new(ctx),
                Err(e) => {
                    error!("client initialization failed: {:?}, exit...", e);
                    exit(1);
                }
            };
            for (i, host) in host_vec.iter().enumerate() {
                if let Err(e) = ctx.connect(host, config.port, i) {
                    error!("client connect to {} failed: {:?}", host, e);
                    exit(1);
                }
            }
            clients.push(ctx);
        }

        let stoppers: Vec<Arc<RdmaContext>> = clients.clone();
        let _ = ctrlc::set_handler(move || {
            for ctx in &stoppers {
                ctx.request_stop();
            }
        });

        let mut client_threads = Vec::new();
        for ctx in clients {
            let ctrl = ctx.config().ctrl;
            client_threads.push(thread::spawn(move || {
                let ret = if ctrl {
                    ctx.measure_thp()
                } else {
                    ctx.client_datapath()
                };
                if ret.is_err() {
                    error!("client datapath hit a fatal completion error");
                    exit(1);
                }
            }));
        }
        for t in client_threads {
            let _ = t.join();
        }
    }
}
