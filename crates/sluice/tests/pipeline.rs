use std::{
    io::Write,
    net::SocketAddr,
    os::fd::OwnedFd,
    os::unix::net::UnixStream,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use sluice::{
    Connection, Pipeline, PollInStage, Protocol, QueueScheduler, RecycleStage, Scheduler, Stage,
};

struct EchoProtocol;

impl Protocol for EchoProtocol {
    type Session = ();

    fn new_session(&self) {}
}

/// Stand-in for the parser stage: just a queue the ingress stage feeds.
struct SinkStage {
    sched: QueueScheduler<EchoProtocol>,
}

impl SinkStage {
    fn new() -> Arc<Self> {
        Arc::new(Self { sched: QueueScheduler::new(false) })
    }
}

impl Stage<EchoProtocol> for SinkStage {
    fn name(&self) -> &'static str {
        "parser"
    }

    fn scheduler(&self) -> Option<&dyn Scheduler<EchoProtocol>> {
        Some(&self.sched)
    }
}

struct Rig {
    pipeline: Arc<Pipeline<EchoProtocol>>,
    poll_in: Arc<PollInStage<EchoProtocol>>,
    parser: Arc<SinkStage>,
}

fn build_rig() -> Rig {
    let pipeline = Pipeline::new(EchoProtocol);
    let poll_in = PollInStage::new();
    let parser = SinkStage::new();
    let recycle = RecycleStage::new(1);

    pipeline.set_poll_in_stage(&poll_in);
    pipeline.add_stage("parser", Arc::clone(&parser) as Arc<dyn Stage<EchoProtocol>>);
    pipeline.add_stage("recycle", recycle as Arc<dyn Stage<EchoProtocol>>);
    pipeline.initialize_stages().expect("stage initialization");

    // one poller worker; wait for it to come up before registering fds
    let stage: Arc<dyn Stage<EchoProtocol>> = Arc::clone(&poll_in) as _;
    sluice::start_stage_thread(&stage, &pipeline, 0).expect("spawn poll_in worker");
    let deadline = Instant::now() + Duration::from_secs(2);
    while poll_in.poller_count() == 0 {
        assert!(Instant::now() < deadline, "poller worker never came up");
        thread::sleep(Duration::from_millis(5));
    }

    Rig { pipeline, poll_in, parser }
}

fn make_conn(rig: &Rig) -> (Arc<Connection<EchoProtocol>>, UnixStream) {
    let (local, peer) = UnixStream::pair().expect("socketpair");
    local.set_nonblocking(true).expect("nonblocking");
    let sock: OwnedFd = local.into();
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
    let conn = rig.pipeline.create_connection(sock, addr);
    (conn, peer)
}

#[test]
fn ingress_reads_feed_the_parser_queue() {
    let rig = build_rig();
    let (conn, mut peer) = make_conn(&rig);
    assert!(rig.poll_in.sched_add(&conn), "poller registration");

    peer.write_all(b"ping").expect("client write");

    let picked = rig.parser.sched.pick_task(rig.pipeline.quiesce());
    assert_eq!(picked.id(), conn.id());
    let mut got = [0u8; 4];
    assert!(picked.streams().input.buffer().copy_front(&mut got));
    assert_eq!(&got, b"ping");
    picked.unlock();
}

#[test]
fn dispose_removes_connection_everywhere() {
    let rig = build_rig();
    let (conn, _peer) = make_conn(&rig);
    assert!(rig.poll_in.sched_add(&conn));
    rig.parser.sched.add_task(&conn);
    assert_eq!(rig.poll_in.registered_connections(), 1);
    assert_eq!(rig.parser.sched.len(), 1);

    {
        let _exclusive = rig.pipeline.quiesce().exclusive();
        rig.pipeline.dispose_connection(&conn);
    }

    assert_eq!(rig.poll_in.registered_connections(), 0, "poller still references the connection");
    assert_eq!(rig.parser.sched.len(), 0, "scheduler still references the connection");
    assert_eq!(rig.pipeline.connection_count(), 0);
}

#[test]
fn shared_quiesce_holders_block_disposal() {
    let rig = build_rig();
    let (conn, _peer) = make_conn(&rig);

    let shared = rig.pipeline.quiesce().shared();
    let (tx, rx) = mpsc::channel();
    let disposer = {
        let pipeline = Arc::clone(&rig.pipeline);
        thread::spawn(move || {
            let _exclusive = pipeline.quiesce().exclusive();
            pipeline.dispose_connection(&conn);
            tx.send(()).expect("report disposal");
        })
    };

    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "disposal started while a shared holder existed"
    );
    drop(shared);
    rx.recv_timeout(Duration::from_secs(2)).expect("disposal never finished");
    disposer.join().expect("disposer panicked");
}

#[test]
fn peer_hangup_lands_the_connection_in_recycle() {
    let rig = build_rig();
    let (conn, peer) = make_conn(&rig);
    assert!(rig.poll_in.sched_add(&conn));

    drop(peer);

    // recycle batch size is 1, so the recycle worker isn't even needed:
    // cleanup must deregister the fd and mark the connection dead
    let deadline = Instant::now() + Duration::from_secs(3);
    while !conn.is_inactive() {
        assert!(Instant::now() < deadline, "hangup never cleaned up");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(rig.poll_in.registered_connections(), 0);
}
