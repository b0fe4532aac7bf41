use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

use traffic::config::Config;
use traffic::context::RdmaContext;
use traffic::verbs::sim::SimVerbs;
use traffic::verbs::RdmaVerbs;
use traffic::TrafficError;

fn base_config() -> Config {
    Config {
        buf_num: 4,
        buf_size: 1024,
        send_wq_depth: 16,
        recv_wq_depth: 16,
        send_batch: 4,
        recv_batch: 8,
        request: "s:1:64".to_string(),
        receive: "1:1024".to_string(),
        ..Default::default()
    }
}

fn server_config(host_num: usize, qp_num: usize) -> Config {
    Config {
        server: true,
        host_num,
        qp_num,
        ..base_config()
    }
}

fn client_config(qp_num: usize) -> Config {
    Config {
        host_num: 1,
        qp_num,
        ..base_config()
    }
}

/// Bind a loopback listener and serve every inbound handshake on its own
/// thread, the way the real accept loop does.
fn spawn_server(verbs: &Arc<SimVerbs>, config: Config) -> (Arc<RdmaContext>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = Arc::new(RdmaContext::new(verbs.clone() as Arc<dyn RdmaVerbs>, config).unwrap());
    let server_ctx = ctx.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            let handler_ctx = server_ctx.clone();
            thread::spawn(move || {
                let _ = handler_ctx.accept_handler(stream);
            });
        }
    });
    (ctx, addr)
}

fn new_client(verbs: &Arc<SimVerbs>, config: Config) -> Arc<RdmaContext> {
    Arc::new(RdmaContext::new(verbs.clone() as Arc<dyn RdmaVerbs>, config).unwrap())
}

#[test]
fn two_clients_split_the_capacity() {
    // server capacity 4 endpoints, two clients request 2 each concurrently
    let verbs = Arc::new(SimVerbs::new());
    let (server, addr) = spawn_server(&verbs, server_config(2, 2));

    let mut joins = Vec::new();
    for _ in 0..2 {
        let client = new_client(&verbs, client_config(2));
        let ip = addr.ip().to_string();
        let port = addr.port();
        joins.push(thread::spawn(move || {
            let ret = client.connect(&ip, port, 0);
            (client, ret)
        }));
    }
    for join in joins {
        let (client, ret) = join.join().unwrap();
        assert_eq!(ret, Ok(()));
        for ep in client.endpoints().iter().flatten() {
            assert!(ep.lock().unwrap().activated());
        }
    }

    assert_eq!(server.reserved_ids(), 4);
    for id in 0..4 {
        let ep = server.endpoint(id).unwrap();
        let ep = ep.lock().unwrap();
        assert!(ep.activated(), "server endpoint {} not activated", id);
        // receives were pre-posted up to the queue depth
        assert_eq!(ep.recv_credits(), 0);
    }
}

#[test]
fn oversized_request_is_rejected_and_reserves_nothing() {
    // capacity 2, the client asks for 3
    let verbs = Arc::new(SimVerbs::new());
    let (server, addr) = spawn_server(&verbs, server_config(1, 2));

    let client = new_client(&verbs, client_config(3));
    let ret = client.connect(&addr.ip().to_string(), addr.port(), 0);
    assert_eq!(ret, Err(TrafficError::CapacityExceeded));

    assert_eq!(server.reserved_ids(), 0);
    for ep in client.endpoints().iter().flatten() {
        assert!(!ep.lock().unwrap().activated());
    }
}

#[test]
fn concurrent_reservations_never_overlap() {
    let verbs = Arc::new(SimVerbs::new());
    let ctx = Arc::new(
        RdmaContext::new(
            verbs as Arc<dyn RdmaVerbs>,
            server_config(8, 8), // capacity 64
        )
        .unwrap(),
    );

    let mut joins = Vec::new();
    for _ in 0..8 {
        let ctx = ctx.clone();
        joins.push(thread::spawn(move || ctx.reserve_ids(8).unwrap()));
    }
    let mut ranges: Vec<usize> = joins.into_iter().map(|j| j.join().unwrap()).collect();
    ranges.sort_unstable();
    // disjoint contiguous ranges tile [0, 64) exactly
    for (i, left) in ranges.iter().enumerate() {
        assert_eq!(*left, i * 8);
    }
    // and the next oversized request bounces without moving the counter
    assert_eq!(ctx.reserve_ids(1), Err(TrafficError::CapacityExceeded));
    assert_eq!(ctx.reserved_ids(), 64);
}

#[test]
fn failed_activation_aborts_the_handshake() {
    let verbs = Arc::new(SimVerbs::new());
    let (server, addr) = spawn_server(&verbs, server_config(1, 1));

    verbs.inject_modify_failure();
    let client = new_client(&verbs, client_config(1));
    let ret = client.connect(&addr.ip().to_string(), addr.port(), 0);
    assert!(ret.is_err());

    // the server side aborted mid-handshake and left its endpoint inactive
    let ep = server.endpoint(0).unwrap();
    assert!(!ep.lock().unwrap().activated());
}

#[test]
fn traffic_flows_after_the_handshake() {
    let verbs = Arc::new(SimVerbs::new());
    let (server, addr) = spawn_server(&verbs, server_config(1, 1));

    let mut config = client_config(1);
    config.iters = 4;
    let client = new_client(&verbs, config);
    client
        .connect(&addr.ip().to_string(), addr.port(), 0)
        .unwrap();

    let server_loop = {
        let server = server.clone();
        thread::spawn(move || server.server_datapath())
    };

    client.client_datapath().unwrap();
    server.request_stop();
    server_loop.join().unwrap().unwrap();

    // every send completed and gave its credit back
    let ep = client.endpoint(0).unwrap();
    let ep = ep.lock().unwrap();
    assert_eq!(ep.send_credits(), ep.send_wq_depth() as i32);
    assert_eq!(ep.outstanding_sends(), 0);
    assert!(ep.accumulated_ops() > 0);

    // and the receiver saw the matching completions
    let sep = server.endpoint(0).unwrap();
    assert!(sep.lock().unwrap().accumulated_ops() > 0);
}
