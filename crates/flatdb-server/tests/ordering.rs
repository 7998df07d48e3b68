//! Operations on one partition execute in submission order while
//! different partitions run on their own contexts.

use std::sync::{Arc, Mutex};
use std::thread;

use flatdb_core::{Backend, BackendResult, PartitionId};
use flatdb_server::{BackendRegistry, DataServer, ServerConfig};
use futures::future::{self, BoxFuture, FutureExt};

fn started(partitions: &[i32], context_threads: usize) -> DataServer {
    let config = ServerConfig::new()
        .name("ordering")
        .partitions(partitions.iter().copied())
        .backend("list")
        .context_threads(context_threads);
    let server = DataServer::new(&config, &BackendRegistry::default()).unwrap();
    server.start().unwrap();
    server
}

fn read_all(server: &DataServer, partition: PartitionId, count: usize) -> Vec<Vec<u8>> {
    (0..count as i32)
        .map(|i| server.read(partition, i.to_be_bytes().to_vec()).wait().unwrap())
        .collect()
}

#[test]
fn test_interleaved_submissions_keep_per_partition_order() {
    for context_threads in [0, 1, 2] {
        let server = started(&[1, 2, 3, 4], context_threads);
        let mut pending = Vec::new();
        for seq in 0..200u32 {
            let partition = PartitionId((seq % 4) as i32 + 1);
            pending.push(server.write(partition, seq.to_be_bytes().to_vec()));
        }
        for c in pending {
            c.wait().unwrap();
        }
        for p in 1..=4 {
            let got = read_all(&server, PartitionId(p), 50);
            let expected: Vec<Vec<u8>> = (0..200u32)
                .filter(|seq| (seq % 4) as i32 + 1 == p)
                .map(|seq| seq.to_be_bytes().to_vec())
                .collect();
            assert_eq!(got, expected, "partition {p} contexts {context_threads}");
        }
        server.stop().unwrap();
    }
}

#[test]
fn test_concurrent_clients_fifo_per_thread() {
    let server = Arc::new(started(&[1, 2], 0));
    let handles: Vec<_> = (0..4u8)
        .map(|client| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let partition = PartitionId((client % 2) as i32 + 1);
                let writes: Vec<_> = (0..50u8)
                    .map(|n| server.write(partition, vec![client, n]))
                    .collect();
                for w in writes {
                    w.wait().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for p in 1..=2 {
        let items = read_all(&server, PartitionId(p), 100);
        for client in 0..4u8 {
            let seq: Vec<u8> = items.iter().filter(|i| i[0] == client).map(|i| i[1]).collect();
            if seq.is_empty() {
                continue;
            }
            assert_eq!(seq, (0..50).collect::<Vec<u8>>(), "client {client} on {p}");
        }
    }
}

/// Records which OS thread ran each call.
struct ThreadRecorder {
    seen: Arc<Mutex<Vec<thread::ThreadId>>>,
}

impl Backend for ThreadRecorder {
    fn write(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        self.seen.lock().unwrap().push(thread::current().id());
        future::ready(Ok(())).boxed()
    }
}

#[test]
fn test_backend_never_runs_on_caller_thread() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend: Box<dyn Backend> = Box::new(ThreadRecorder {
        seen: Arc::clone(&seen),
    });
    let config = ServerConfig::new().name("threads").partitions([9]).backend("n/a");
    let server = DataServer::with_backends(&config, vec![(PartitionId(9), backend)]).unwrap();
    server.start().unwrap();
    for _ in 0..10 {
        server.write(PartitionId(9), Vec::new()).wait().unwrap();
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|t| *t == seen[0]));
    assert_ne!(seen[0], thread::current().id());
}
