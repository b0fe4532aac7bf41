use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use traffic::config::Config;
use traffic::context::RdmaContext;
use traffic::memory::PoolSelector;
use traffic::memory::RdmaBuffer;
use traffic::request::parse_requests;
use traffic::verbs::sim::SimVerbs;
use traffic::verbs::{QpType, RdmaVerbs};
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

fn spawn_server(verbs: &Arc<SimVerbs>) -> (Arc<RdmaContext>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        server: true,
        ..base_config()
    };
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

/// One connected endpoint pair over the simulated fabric.
fn connected_pair(verbs: &Arc<SimVerbs>) -> (Arc<RdmaContext>, Arc<RdmaContext>) {
    let (server, addr) = spawn_server(verbs);
    let client =
        Arc::new(RdmaContext::new(verbs.clone() as Arc<dyn RdmaVerbs>, base_config()).unwrap());
    client
        .connect(&addr.ip().to_string(), addr.port(), 0)
        .unwrap();
    (server, client)
}

fn substitute(ctx: &RdmaContext, reqs: &mut [traffic::request::RdmaRequest]) {
    for req in reqs.iter_mut() {
        for sge in req.sgl.iter_mut() {
            let buf = ctx.pick_next(PoolSelector::Send).unwrap();
            sge.addr = buf.addr;
            sge.lkey = buf.lkey;
        }
    }
}

#[test]
fn credits_flow_back_through_completions() {
    let verbs = Arc::new(SimVerbs::new());
    let (_server, client) = connected_pair(&verbs);

    let mut reqs = parse_requests("s:1:64", QpType::Rc, false).unwrap();
    let mut cursor = 0usize;
    let ep = client.endpoint(0).unwrap();

    {
        let mut ep = ep.lock().unwrap();
        let depth = ep.send_wq_depth() as i32;
        let pool = client.remote_pool(ep.mem_id()).unwrap();
        substitute(&client, &mut reqs);
        ep.post_send(&reqs, &mut cursor, 3, &pool).unwrap();
        assert_eq!(ep.send_credits(), depth - 3);
        assert_eq!(ep.outstanding_sends(), 3);
        // credit + outstanding == configured depth, always
        assert_eq!(ep.send_credits() + ep.outstanding_sends() as i32, depth);
    }

    for cq in client.send_cqs().to_vec() {
        client.poll_each(cq).unwrap();
    }

    let mut ep = ep.lock().unwrap();
    assert_eq!(ep.send_credits(), ep.send_wq_depth() as i32);
    assert_eq!(ep.outstanding_sends(), 0);

    // the throughput sample consumes the counters
    let (bw, rate) = ep.get_throughput(Instant::now());
    assert!(bw > 0.0 && rate > 0.0);
    let (bw, rate) = ep.get_throughput(Instant::now());
    assert!(bw == 0.0 && rate == 0.0);
}

#[test]
fn post_beyond_credit_is_rejected_up_front() {
    let verbs = Arc::new(SimVerbs::new());
    let (_server, client) = connected_pair(&verbs);

    let mut reqs = parse_requests("s:1:64", QpType::Rc, false).unwrap();
    let mut cursor = 0usize;
    let ep = client.endpoint(0).unwrap();
    let mut ep = ep.lock().unwrap();
    let pool = client.remote_pool(ep.mem_id()).unwrap();

    substitute(&client, &mut reqs);
    ep.post_send(&reqs, &mut cursor, 11, &pool).unwrap();
    assert_eq!(ep.send_credits(), 5);

    // a batch of 8 against 5 remaining credits never reaches the wire
    substitute(&client, &mut reqs);
    let ret = ep.post_send(&reqs, &mut cursor, 8, &pool);
    assert_eq!(ret, Err(TrafficError::NoCredits));
    assert_eq!(ep.send_credits(), 5);
    assert_eq!(ep.outstanding_sends(), 11);
}

#[test]
fn partial_acceptance_reports_the_exact_count() {
    let verbs = Arc::new(SimVerbs::new());
    let (_server, client) = connected_pair(&verbs);

    let mut reqs = parse_requests("s:1:64", QpType::Rc, false).unwrap();
    let mut cursor = 0usize;
    let ep = client.endpoint(0).unwrap();
    let mut ep = ep.lock().unwrap();
    let pool = client.remote_pool(ep.mem_id()).unwrap();

    // the transport takes only 5 of the 8
    verbs.limit_sq(ep.qp(), 5);
    substitute(&client, &mut reqs);
    let ret = ep.post_send(&reqs, &mut cursor, 8, &pool);
    assert_eq!(ret, Err(TrafficError::PartialPost(5)));
    // only the accepted requests consumed credit
    assert_eq!(ep.send_credits(), ep.send_wq_depth() as i32 - 5);
    assert_eq!(ep.outstanding_sends(), 5);
}

#[test]
fn send_pool_cycles_buffers_in_order() {
    let verbs = Arc::new(SimVerbs::new());
    let (_server, client) = connected_pair(&verbs);

    // w:1:64 against a 4-buffer send pool: buffer0..buffer3, then wrap
    let mut reqs = parse_requests("w:1:64", QpType::Rc, false).unwrap();
    let mut cursor = 0usize;
    let ep = client.endpoint(0).unwrap();
    let mut ep = ep.lock().unwrap();
    let pool = client.remote_pool(ep.mem_id()).unwrap();

    let mut addrs = Vec::new();
    for _ in 0..5 {
        substitute(&client, &mut reqs);
        addrs.push(reqs[0].sgl[0].addr);
        ep.post_send(&reqs, &mut cursor, 1, &pool).unwrap();
    }
    assert_eq!(addrs[4], addrs[0]);
    // four distinct buffers, one buf_size apart, in allocation order
    assert!(addrs[0..4].windows(2).all(|w| w[1] == w[0] + 1024));
}

#[test]
fn bad_completion_status_is_fatal() {
    let verbs = Arc::new(SimVerbs::new());
    let (_server, client) = connected_pair(&verbs);

    let mut reqs = parse_requests("w:1:64", QpType::Rc, false).unwrap();
    let mut cursor = 0usize;
    let ep = client.endpoint(0).unwrap();
    {
        let mut ep = ep.lock().unwrap();
        // a remote descriptor with a key the fabric never handed out
        let bogus = vec![RdmaBuffer::new(0x1000, 64, 0, 0xbad)];
        substitute(&client, &mut reqs);
        ep.post_send(&reqs, &mut cursor, 1, &bogus).unwrap();
    }

    let mut saw_fatal = false;
    for cq in client.send_cqs().to_vec() {
        if client.poll_each(cq) == Err(TrafficError::CompletionError) {
            saw_fatal = true;
        }
    }
    assert!(saw_fatal);
}
