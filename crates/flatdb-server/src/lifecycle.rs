//! `DataServer` — the lifecycle orchestrator.
//!
//! Owns the dispatch fabric and is the only thing that changes a
//! partition's state. `start` opens every eligible partition in
//! parallel (each on its own context), waits for all of them, and then
//! records the outcome per partition. `stop` does the same with
//! `close`, but only for partitions that are `Started`.
//!
//! Failures are aggregated, never short-circuited: one partition that
//! fails to open leaves its siblings running and is reported by id in
//! the returned [`LifecycleError`].
//!
//! Requests for a partition that is not `Started` fail immediately with
//! `NotStarted`; unknown partitions fail with `UnknownPartition`.
//! Neither reaches a backend.

use std::sync::Arc;

use futures::executor::block_on;
use tracing::{debug, error, info, warn};

use flatdb_core::dispatch::{Completer, Dispatcher};
use flatdb_core::protocol::{Operation, Request};
use flatdb_core::{Backend, DispatchError, PartitionId};

use crate::backends::BackendRegistry;
use crate::completion::Completion;
use crate::config::ServerConfig;
use crate::error::{LifecycleError, PartitionFailure, ServerError};
use crate::fabric::{DispatchFabric, PartitionState};

pub struct DataServer {
    name: Arc<str>,
    fabric: DispatchFabric,
}

impl DataServer {
    /// Build backends for every configured partition through `registry`.
    pub fn new(config: &ServerConfig, registry: &BackendRegistry) -> Result<Self, ServerError> {
        config.validate()?;
        let backends = registry.create(&config.backend, &config.partitions)?;
        Self::with_backends(config, backends)
    }

    /// Use caller-provided backend instances. Only `name` and
    /// `context_threads` are taken from `config`.
    pub fn with_backends(
        config: &ServerConfig,
        backends: Vec<(PartitionId, Box<dyn Backend>)>,
    ) -> Result<Self, ServerError> {
        let fabric = DispatchFabric::new(backends, config.context_threads)?;
        info!(
            db = %config.name,
            partitions = fabric.partitions().count(),
            contexts = fabric.context_count(),
            "data server created"
        );
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            fabric,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.fabric.partitions().collect()
    }

    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.fabric.state(partition)
    }

    pub fn fabric(&self) -> &DispatchFabric {
        &self.fabric
    }

    /// Open every partition that is not already running.
    ///
    /// Returns once every open has finished. Partitions that opened are
    /// `Started` even when the call returns an error.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut pending = Vec::new();
        for partition in self.fabric.partitions() {
            let Some(state) = self.fabric.state(partition) else {
                continue;
            };
            // A concurrent start or stop that got here first wins.
            if !state.can_start() || !self.fabric.transition(partition, state, PartitionState::Starting) {
                debug!(partition = %partition, state = %state, "skipping start");
                continue;
            }

            let (resolver, completion) = Completion::channel();
            let name = Arc::clone(&self.name);
            let submitted = self.fabric.submit(partition, move |backend| {
                let outcome = block_on(backend.open(&name, partition))
                    .map_err(|source| DispatchError::Backend { partition, source });
                resolver.resolve(outcome);
            });
            let completion = match submitted {
                Ok(()) => completion,
                Err(e) => Completion::failed(e),
            };
            pending.push((partition, completion));
        }

        let mut failures = Vec::new();
        for (partition, completion) in pending {
            match completion.wait() {
                Ok(()) => {
                    self.fabric.set_state(partition, PartitionState::Started);
                    info!(db = %self.name, partition = %partition, "partition started");
                }
                Err(error) => {
                    self.fabric.set_state(partition, PartitionState::Failed);
                    error!(db = %self.name, partition = %partition, error = %error, "partition failed to open");
                    failures.push(PartitionFailure { partition, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Open(failures))
        }
    }

    /// Close every `Started` partition; everything else is skipped.
    ///
    /// A partition whose close fails stays `Started`.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let mut pending = Vec::new();
        for partition in self.fabric.partitions() {
            if !self
                .fabric
                .transition(partition, PartitionState::Started, PartitionState::Stopping)
            {
                continue;
            }

            let (resolver, completion) = Completion::channel();
            let submitted = self.fabric.submit(partition, move |backend| {
                let outcome = block_on(backend.close())
                    .map_err(|source| DispatchError::Backend { partition, source });
                resolver.resolve(outcome);
            });
            let completion = match submitted {
                Ok(()) => completion,
                Err(e) => Completion::failed(e),
            };
            pending.push((partition, completion));
        }

        let mut failures = Vec::new();
        for (partition, completion) in pending {
            match completion.wait() {
                Ok(()) => {
                    self.fabric.set_state(partition, PartitionState::Stopped);
                    info!(db = %self.name, partition = %partition, "partition stopped");
                }
                Err(error) => {
                    self.fabric.set_state(partition, PartitionState::Started);
                    error!(db = %self.name, partition = %partition, error = %error, "partition failed to close");
                    failures.push(PartitionFailure { partition, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Close(failures))
        }
    }

    /// Run a read on `partition`'s backend.
    pub fn read(&self, partition: PartitionId, body: Vec<u8>) -> Completion<Vec<u8>> {
        if let Err(e) = self.check_started(partition) {
            return Completion::failed(e);
        }
        let (resolver, completion) = Completion::channel();
        let submitted = self.fabric.submit(partition, move |backend| {
            let outcome = block_on(backend.read(body))
                .map_err(|source| DispatchError::Backend { partition, source });
            resolver.resolve(outcome);
        });
        match submitted {
            Ok(()) => completion,
            Err(e) => Completion::failed(e),
        }
    }

    /// Run a write on `partition`'s backend.
    pub fn write(&self, partition: PartitionId, body: Vec<u8>) -> Completion<()> {
        if let Err(e) = self.check_started(partition) {
            return Completion::failed(e);
        }
        let (resolver, completion) = Completion::channel();
        let submitted = self.fabric.submit(partition, move |backend| {
            let outcome = block_on(backend.write(body))
                .map_err(|source| DispatchError::Backend { partition, source });
            resolver.resolve(outcome);
        });
        match submitted {
            Ok(()) => completion,
            Err(e) => Completion::failed(e),
        }
    }

    fn check_started(&self, partition: PartitionId) -> Result<(), DispatchError> {
        match self.fabric.state(partition) {
            None => Err(DispatchError::UnknownPartition(partition)),
            Some(PartitionState::Started) => Ok(()),
            Some(_) => Err(DispatchError::NotStarted(partition)),
        }
    }
}

/// Reactor entry point. Completes on the partition's context thread,
/// or immediately for requests rejected up front.
impl Dispatcher for DataServer {
    fn dispatch(&self, request: Request, completer: Completer) {
        let Request {
            request_id,
            op_code,
            partition,
            body,
        } = request;

        let op = match Operation::try_from(op_code) {
            Ok(op) => op,
            Err(_) => return completer.fail(DispatchError::UnsupportedOperation(op_code)),
        };
        if let Err(e) = self.check_started(partition) {
            debug!(request_id, partition = %partition, error = %e, "rejected");
            return completer.fail(e);
        }

        let submitted = match op {
            Operation::Read => self.fabric.submit(partition, move |backend| {
                let outcome = block_on(backend.read(body))
                    .map_err(|source| DispatchError::Backend { partition, source });
                completer.complete(outcome);
            }),
            Operation::Write => self.fabric.submit(partition, move |backend| {
                let outcome = block_on(backend.write(body))
                    .map(|()| Vec::new())
                    .map_err(|source| DispatchError::Backend { partition, source });
                completer.complete(outcome);
            }),
        };
        // The dropped job took the completer with it; the request
        // resolves as abandoned.
        if let Err(e) = submitted {
            warn!(request_id, partition = %partition, error = %e, "submit failed");
        }
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.fabric.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ListBackend;
    use flatdb_core::{BackendError, BackendResult};
    use futures::future::{self, BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::new().name("test").partitions([1, 2, 3]).backend("list")
    }

    #[derive(Clone, Default)]
    struct Calls {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    /// Counts lifecycle calls; fails `open` when told to.
    struct Tracked {
        calls: Calls,
        fail_open: bool,
        open_delay: Duration,
    }

    impl Backend for Tracked {
        fn open<'a>(&'a mut self, _db: &'a str, p: PartitionId) -> BoxFuture<'a, BackendResult<()>> {
            self.calls.opens.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.open_delay);
            let result = if self.fail_open {
                Err(BackendError::msg(format!("cannot open store for {}", p)))
            } else {
                Ok(())
            };
            future::ready(result).boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, BackendResult<()>> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(())).boxed()
        }
    }

    fn tracked(calls: &Calls, failing: &[i32]) -> Vec<(PartitionId, Box<dyn Backend>)> {
        [1, 2, 3]
            .iter()
            .map(|&id| {
                let backend = Tracked {
                    calls: calls.clone(),
                    fail_open: failing.contains(&id),
                    open_delay: Duration::ZERO,
                };
                (PartitionId(id), Box::new(backend) as Box<dyn Backend>)
            })
            .collect()
    }

    #[test]
    fn test_write_then_read() {
        let server = DataServer::new(&config(), &BackendRegistry::default()).unwrap();
        server.start().unwrap();
        server.write(PartitionId(1), b"123".to_vec()).wait().unwrap();
        let got = server
            .read(PartitionId(1), 0i32.to_be_bytes().to_vec())
            .wait()
            .unwrap();
        assert_eq!(got, b"123");
        server.stop().unwrap();
        assert_eq!(server.state(PartitionId(1)), Some(PartitionState::Stopped));
    }

    #[test]
    fn test_partial_open_failure() {
        let calls = Calls::default();
        let server = DataServer::with_backends(&config(), tracked(&calls, &[2])).unwrap();
        let err = server.start().unwrap_err();

        assert_eq!(err.failed_partitions(), vec![PartitionId(2)]);
        assert!(err.to_string().contains("partition 2"), "{err}");
        assert_eq!(server.state(PartitionId(1)), Some(PartitionState::Started));
        assert_eq!(server.state(PartitionId(2)), Some(PartitionState::Failed));
        assert_eq!(server.state(PartitionId(3)), Some(PartitionState::Started));
        assert_eq!(calls.opens.load(Ordering::SeqCst), 3);

        // The failed partition fails fast.
        assert!(matches!(
            server.write(PartitionId(2), Vec::new()).wait(),
            Err(DispatchError::NotStarted(PartitionId(2)))
        ));

        server.stop().unwrap();
        assert_eq!(calls.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_without_start_closes_nothing() {
        let calls = Calls::default();
        let server = DataServer::with_backends(&config(), tracked(&calls, &[1, 2, 3])).unwrap();
        assert!(server.start().is_err());
        server.stop().unwrap();
        assert_eq!(calls.closes.load(Ordering::SeqCst), 0);

        let fresh = Calls::default();
        let idle = DataServer::with_backends(&config(), tracked(&fresh, &[])).unwrap();
        idle.stop().unwrap();
        assert_eq!(fresh.closes.load(Ordering::SeqCst), 0);
        assert_eq!(idle.state(PartitionId(1)), Some(PartitionState::Uninitialized));
    }

    #[test]
    fn test_start_is_idempotent_for_started() {
        let calls = Calls::default();
        let server = DataServer::with_backends(&config(), tracked(&calls, &[])).unwrap();
        server.start().unwrap();
        server.start().unwrap();
        assert_eq!(calls.opens.load(Ordering::SeqCst), 3);
        server.stop().unwrap();
        server.stop().unwrap();
        assert_eq!(calls.closes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_start_and_stop_touch_each_backend_once() {
        let calls = Calls::default();
        let backends = [1, 2, 3]
            .iter()
            .map(|&id| {
                let backend = Tracked {
                    calls: calls.clone(),
                    fail_open: false,
                    open_delay: Duration::from_millis(50),
                };
                (PartitionId(id), Box::new(backend) as Box<dyn Backend>)
            })
            .collect();
        let server = Arc::new(DataServer::with_backends(&config(), backends).unwrap());

        let run = |op: fn(&DataServer) -> Result<(), LifecycleError>| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let server = Arc::clone(&server);
                    thread::spawn(move || op(&server))
                })
                .collect();
            for h in handles {
                h.join().unwrap().unwrap();
            }
        };

        run(DataServer::start);
        assert_eq!(calls.opens.load(Ordering::SeqCst), 3);
        run(DataServer::stop);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 3);
        for p in server.partitions() {
            assert_eq!(server.state(p), Some(PartitionState::Stopped));
        }
    }

    #[test]
    fn test_unknown_partition_fails_fast() {
        let server = DataServer::new(&config(), &BackendRegistry::default()).unwrap();
        server.start().unwrap();
        assert!(matches!(
            server.read(PartitionId(42), Vec::new()).wait(),
            Err(DispatchError::UnknownPartition(PartitionId(42)))
        ));

        let (tx, rx) = mpsc::channel();
        server.dispatch(
            Request::new(1, Operation::Read, PartitionId(42), Vec::new()),
            Completer::new(move |r| tx.send(r).unwrap()),
        );
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(DispatchError::UnknownPartition(PartitionId(42)))));
    }

    #[test]
    fn test_not_started_fails_fast() {
        let server = DataServer::new(&config(), &BackendRegistry::default()).unwrap();
        assert!(matches!(
            server.write(PartitionId(1), b"x".to_vec()).wait(),
            Err(DispatchError::NotStarted(PartitionId(1)))
        ));
    }

    #[test]
    fn test_dispatch_write_returns_empty_body() {
        let server = DataServer::new(&config(), &BackendRegistry::default()).unwrap();
        server.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        server.dispatch(
            Request::new(1, Operation::Write, PartitionId(3), b"abc".to_vec()),
            Completer::new(move |r| tx.send(r).unwrap()),
        );
        server.dispatch(
            Request::new(2, Operation::Read, PartitionId(3), 0i32.to_be_bytes().to_vec()),
            Completer::new(move |r| tx2.send(r).unwrap()),
        );
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(first.is_empty());
        assert_eq!(second, b"abc");
    }

    #[test]
    fn test_backend_error_carries_partition() {
        let mut registry = BackendRegistry::empty();
        registry.register("list", |_| Box::new(ListBackend::new()));
        let server = DataServer::new(&config(), &registry).unwrap();
        server.start().unwrap();
        let err = server
            .read(PartitionId(2), 7i32.to_be_bytes().to_vec())
            .wait()
            .unwrap_err();
        assert_eq!(err.partition(), Some(PartitionId(2)));
        assert!(matches!(err, DispatchError::Backend { .. }));
    }
}
