//! Full stack over TCP: client → reactor → dispatch fabric → backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};

use flatdb::{
    Backend, BackendRegistry, BackendResult, Client, Node, Operation, PartitionId, ReactorConfig,
    Request, ResponseKind, ServerConfig,
};

fn config() -> ServerConfig {
    ServerConfig::new()
        .name("e2e")
        .partitions([1, 2, 3])
        .backend("list")
        .port(0)
        .buffer_size(16)
}

fn node() -> Node {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Node::start(&config(), &BackendRegistry::default()).unwrap()
}

fn client(node: &Node) -> Client {
    let port = node.local_addr().port();
    let client = Client::connect(("127.0.0.1", port)).unwrap();
    client.set_timeout(Some(Duration::from_secs(5))).unwrap();
    client
}

#[test]
fn test_write_then_read() {
    let mut node = node();
    let mut c = client(&node);

    let resp = c.write(PartitionId(1), b"123").unwrap();
    assert_eq!(resp.kind, ResponseKind::Success);
    assert!(resp.body.is_empty());

    let resp = c.read(PartitionId(1), &0i32.to_be_bytes()).unwrap();
    assert_eq!(resp.kind, ResponseKind::Success);
    assert_eq!(resp.body, b"123");

    node.shutdown().unwrap();
}

#[test]
fn test_unsupported_operation_never_reaches_backend() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::empty();
    let counter = Arc::clone(&calls);
    registry.register("counting", move |_| {
        Box::new(Counting {
            calls: Arc::clone(&counter),
        })
    });
    let config = config().backend("counting");
    let mut node = Node::start(&config, &registry).unwrap();
    let mut c = client(&node);

    let resp = c.call(9, PartitionId(1), b"").unwrap();
    assert_eq!(resp.kind, ResponseKind::Failure);
    let text = String::from_utf8(resp.body).unwrap();
    assert!(text.contains("Unsupported operation 9"), "{text}");
    assert!(text.starts_with("unsupported_operation"), "{text}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    node.shutdown().unwrap();
}

struct Counting {
    calls: Arc<AtomicUsize>,
}

impl Backend for Counting {
    fn read(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(Vec::new())).boxed()
    }

    fn write(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(())).boxed()
    }
}

#[test]
fn test_unknown_partition_fails_fast() {
    let mut node = node();
    let mut c = client(&node);
    let resp = c.read(PartitionId(99), &0i32.to_be_bytes()).unwrap();
    assert_eq!(resp.kind, ResponseKind::Failure);
    let text = String::from_utf8(resp.body).unwrap();
    assert!(text.starts_with("unknown_partition"), "{text}");
    node.shutdown().unwrap();
}

#[test]
fn test_backend_failure_comes_back_as_failure_response() {
    let mut node = node();
    let mut c = client(&node);
    c.write(PartitionId(2), b"only").unwrap();

    let resp = c.read(PartitionId(2), &5i32.to_be_bytes()).unwrap();
    assert_eq!(resp.kind, ResponseKind::Failure);
    let text = String::from_utf8(resp.body).unwrap();
    assert!(text.starts_with("backend_failure: partition 2"), "{text}");
    assert!(text.contains("out of range"), "{text}");

    // The connection is still usable after the failure.
    let resp = c.read(PartitionId(2), &0i32.to_be_bytes()).unwrap();
    assert_eq!(resp.body, b"only");
    node.shutdown().unwrap();
}

/// Reads finish only after a delay; writes succeed immediately.
struct Slow;

impl Backend for Slow {
    fn read(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<Vec<u8>>> {
        thread::sleep(Duration::from_millis(300));
        future::ready(Ok(b"late".to_vec())).boxed()
    }

    fn write(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        future::ready(Ok(())).boxed()
    }
}

#[test]
fn test_completion_for_closed_connection_is_dropped() {
    let mut registry = BackendRegistry::empty();
    registry.register("slow", |_| Box::new(Slow));
    let mut node = Node::start(&config().backend("slow"), &registry).unwrap();

    // First client dispatches a slow read, then gets itself closed by
    // following it with a malformed frame.
    let mut first = client(&node);
    first
        .send(&Request::new(0, Operation::Read, PartitionId(1), Vec::new()))
        .unwrap();
    first.send_raw(&3i32.to_be_bytes()).unwrap();
    assert!(first.recv().is_err());

    // The second client takes over the freed connection slot.
    let mut second = client(&node);
    let resp = second.write(PartitionId(2), b"x").unwrap();
    assert_eq!(resp.request_id, 1);
    assert_eq!(resp.kind, ResponseKind::Success);

    // The slow read finishes meanwhile; nothing of it reaches us.
    second.set_timeout(Some(Duration::from_millis(600))).unwrap();
    let err = second.recv().unwrap_err();
    assert!(
        matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
        "{err}"
    );

    second.set_timeout(Some(Duration::from_secs(5))).unwrap();
    let resp = second.write(PartitionId(3), b"y").unwrap();
    assert_eq!(resp.request_id, 2);
    assert_eq!(resp.kind, ResponseKind::Success);
    node.shutdown().unwrap();
}

#[test]
fn test_fragmented_request_at_every_header_offset() {
    let mut node = node();
    let mut c = client(&node);
    c.write(PartitionId(2), b"fragment").unwrap();

    let req = Request::new(77, Operation::Read, PartitionId(2), 0i32.to_be_bytes().to_vec());
    let wire = req.encode();
    for cut in 1..wire.len() {
        c.send_raw(&wire[..cut]).unwrap();
        thread::sleep(Duration::from_millis(2));
        c.send_raw(&wire[cut..]).unwrap();
        let resp = c.recv().unwrap();
        assert_eq!(resp.request_id, 77, "cut {cut}");
        assert_eq!(resp.body, b"fragment", "cut {cut}");
    }
    node.shutdown().unwrap();
}

#[test]
fn test_pipelined_requests_across_partitions() {
    let mut node = node();
    let mut c = client(&node);
    for (i, p) in [1, 2, 3, 1, 2, 3].iter().enumerate() {
        c.send(&Request::new(i as i32, Operation::Write, PartitionId(*p), vec![i as u8]))
            .unwrap();
    }
    let mut ids: Vec<i32> = (0..6).map(|_| c.recv().unwrap().request_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);

    // Second element written to partition 1 was request 3.
    let resp = c.read(PartitionId(1), &1i32.to_be_bytes()).unwrap();
    assert_eq!(resp.body, vec![3u8]);
    node.shutdown().unwrap();
}

#[test]
fn test_half_closed_client_still_gets_responses() {
    let mut node = node();
    let mut c = client(&node);
    c.send(&Request::new(5, Operation::Write, PartitionId(3), b"x".to_vec()))
        .unwrap();
    c.stream().shutdown(std::net::Shutdown::Write).unwrap();
    let resp = c.recv().unwrap();
    assert_eq!(resp.request_id, 5);
    assert_eq!(resp.kind, ResponseKind::Success);
    node.shutdown().unwrap();
}

#[test]
fn test_many_clients() {
    let mut node = node();
    let port = node.local_addr().port();
    let handles: Vec<_> = (0..8u8)
        .map(|n| {
            thread::spawn(move || {
                let mut c = Client::connect(("127.0.0.1", port)).unwrap();
                c.set_timeout(Some(Duration::from_secs(5))).unwrap();
                for _ in 0..20 {
                    let resp = c.write(PartitionId((n % 3) as i32 + 1), &[n; 40]).unwrap();
                    assert_eq!(resp.kind, ResponseKind::Success);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    node.shutdown().unwrap();
}

#[test]
fn test_reactor_config_from_server_config() {
    let server = ServerConfig {
        max_outbound_bytes: 1 << 16,
        max_in_flight: 32,
        ..config().verbose_errors(true)
    };
    let rc: ReactorConfig = flatdb::reactor_config(&server);
    assert_eq!(rc.port, 0);
    assert_eq!(rc.buffer_size, 16);
    assert!(rc.verbose_errors);
    assert_eq!(rc.max_outbound_bytes, 1 << 16);
    assert_eq!(rc.max_in_flight, 32);
}
