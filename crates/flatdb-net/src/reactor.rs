//! The reactor: one thread, one epoll instance, every socket.
//!
//! ```text
//!   loop {
//!       epoll_wait(timeout)          ← listener, waker, connections
//!       ├─ listener  → accept all, register EPOLLIN
//!       ├─ waker     → drain eventfd
//!       └─ conn      → read → reassemble → dispatch
//!                      write queued responses on EPOLLOUT
//!       drain task queue             ← completions from contexts
//!   }
//! ```
//!
//! Dispatch never blocks the loop. A request is handed to the
//! [`Dispatcher`] with a [`Completer`] that, whichever thread fires it,
//! only pushes a [`ReactorTask`] and pokes the waker. All socket writes
//! happen here, after the task is drained.
//!
//! Epoll is level-triggered. A connection that hits its per-wake read
//! budget is simply reported again on the next wait.
//!
//! A peer that stops collecting responses is throttled: once its queued
//! output or outstanding requests reach [`OutboundLimit`], the reactor
//! drops read interest and stops decoding for it. Whatever the peer
//! keeps sending waits in the kernel until output drains.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::{debug, error, info, warn};

use flatdb_core::dispatch::{Completer, DispatchResult, Dispatcher};
use flatdb_core::error::{DispatchError, ProtocolError};
use flatdb_core::protocol::{Request, Response, DEFAULT_PORT};

use crate::conn::{ConnSlab, Connection, Interest, OutboundLimit, Token};
use crate::error::NetError;
use crate::listener::bind_listener;
use crate::notifier::Waker;
use crate::pool::BufferPool;

const LISTENER: u64 = u64::MAX;
const WAKER: u64 = u64::MAX - 1;

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub bind_addr: Ipv4Addr,
    /// 0 picks an ephemeral port; see [`Reactor::local_addr`].
    pub port: u16,
    pub backlog: i32,
    /// Capacity of each pooled read buffer.
    pub buffer_size: usize,
    pub max_idle_buffers: usize,
    /// Frames whose size prefix exceeds this close the connection.
    pub max_frame_len: usize,
    pub poll_timeout_ms: u16,
    /// Max bytes read from one connection per readiness event.
    pub read_budget: usize,
    /// Failure bodies carry the full error source chain.
    pub verbose_errors: bool,
    pub max_events: usize,
    /// Queued response bytes per connection before reading pauses.
    pub max_outbound_bytes: usize,
    /// Outstanding requests per connection before reading pauses.
    pub max_in_flight: usize,
}

impl ReactorConfig {
    fn outbound_limit(&self) -> OutboundLimit {
        OutboundLimit {
            max_bytes: self.max_outbound_bytes.max(1),
            max_in_flight: self.max_in_flight.max(1),
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            backlog: 4096,
            buffer_size: 1024,
            max_idle_buffers: 1024,
            max_frame_len: 16 * 1024 * 1024,
            poll_timeout_ms: 100,
            read_budget: 256 * 1024,
            verbose_errors: false,
            max_events: 256,
            max_outbound_bytes: OutboundLimit::default().max_bytes,
            max_in_flight: OutboundLimit::default().max_in_flight,
        }
    }
}

/// Work handed to the reactor thread from elsewhere.
pub enum ReactorTask {
    /// A dispatched request finished; write its response.
    Complete {
        token: Token,
        request_id: i32,
        outcome: DispatchResult,
    },
}

struct Shared {
    tasks: SegQueue<ReactorTask>,
    waker: Waker,
    running: AtomicBool,
}

impl Shared {
    fn submit(&self, task: ReactorTask) {
        self.tasks.push(task);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "reactor wake failed");
        }
    }
}

/// Handle to a running reactor thread. Dropping it shuts the loop down.
pub struct Reactor {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Bind the listener and spawn the `flatdb-nio` thread.
    ///
    /// Bind failures are reported here, before any thread exists.
    pub fn start(config: ReactorConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, NetError> {
        let listener = bind_listener(config.bind_addr, config.port, config.backlog).map_err(|source| {
            NetError::Bind {
                addr: config.bind_addr,
                port: config.port,
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            tasks: SegQueue::new(),
            waker: Waker::create()?,
            running: AtomicBool::new(true),
        });

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER))?;
        epoll.add(&shared.waker, EpollEvent::new(EpollFlags::EPOLLIN, WAKER))?;

        let event_loop = EventLoop {
            pool: BufferPool::new(config.buffer_size, config.max_idle_buffers),
            config,
            epoll,
            listener,
            conns: ConnSlab::new(),
            shared: Arc::clone(&shared),
            dispatcher,
            stats: Stats::default(),
        };

        let handle = thread::Builder::new()
            .name("flatdb-nio".into())
            .spawn(move || event_loop.run())?;

        info!(addr = %local_addr, "reactor listening");
        Ok(Self {
            shared,
            local_addr,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop accepting, abandon open connections, and join the thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "reactor wake failed during shutdown");
        }
        if handle.join().is_err() {
            error!("reactor thread panicked");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Default)]
struct Stats {
    accepted: u64,
    closed: u64,
    requests: u64,
    responses: u64,
    stale: u64,
    protocol_errors: u64,
}

struct EventLoop {
    config: ReactorConfig,
    epoll: Epoll,
    listener: TcpListener,
    conns: ConnSlab<Connection>,
    pool: BufferPool,
    shared: Arc<Shared>,
    dispatcher: Arc<dyn Dispatcher>,
    stats: Stats,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = vec![EpollEvent::empty(); self.config.max_events.max(1)];
        let timeout = self.config.poll_timeout_ms;

        while self.shared.running.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => {
                    if self.shared.running.load(Ordering::Acquire) {
                        error!(error = %e, "epoll_wait failed; reactor stopping");
                    }
                    break;
                }
            };

            for ev in &events[..n] {
                match ev.data() {
                    LISTENER => self.accept_all(),
                    WAKER => {
                        if let Err(e) = self.shared.waker.drain() {
                            warn!(error = %e, "waker drain failed");
                        }
                    }
                    raw => self.connection_ready(Token(raw), ev.events()),
                }
            }

            self.drain_tasks();
        }

        self.close_all();
        info!(
            accepted = self.stats.accepted,
            closed = self.stats.closed,
            requests = self.stats.requests,
            responses = self.stats.responses,
            stale = self.stats.stale,
            protocol_errors = self.stats.protocol_errors,
            "reactor stopped"
        );
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true).and_then(|()| stream.set_nodelay(true)) {
                        warn!(peer = %peer, error = %e, "socket setup failed");
                        continue;
                    }
                    let limit = self.config.outbound_limit();
                    let token = self.conns.insert(Connection::new(stream, peer, limit));
                    let registered = match self.conns.get(token) {
                        Some(conn) => self.epoll.add(
                            conn.stream(),
                            EpollEvent::new(interest_flags(conn.interest()), token.0),
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(peer = %peer, error = %e, "epoll registration failed");
                        self.close(token);
                        continue;
                    }
                    self.stats.accepted += 1;
                    debug!(token = %token, peer = %peer, "accepted");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn connection_ready(&mut self, token: Token, flags: EpollFlags) {
        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP) && !self.read(token) {
            return;
        }
        if flags.contains(EpollFlags::EPOLLOUT) && !self.flush(token) {
            return;
        }
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            self.close(token);
            return;
        }
        self.refresh(token);
    }

    /// Read, decode, and dispatch. Returns `false` if the connection
    /// was closed.
    fn read(&mut self, token: Token) -> bool {
        let Some(conn) = self.conns.get_mut(token) else {
            return false;
        };
        if conn.read_closed() || conn.is_backlogged() {
            return true;
        }

        if let Err(e) = conn.read_ready(&mut self.pool, self.config.read_budget) {
            debug!(token = %token, error = %e, "read failed");
            self.close(token);
            return false;
        }
        self.decode(token)
    }

    /// Dispatch every buffered request the connection's limit allows.
    /// Returns `false` if the connection was closed.
    fn decode(&mut self, token: Token) -> bool {
        loop {
            let Some(conn) = self.conns.get_mut(token) else {
                return false;
            };
            match conn.next_request(&mut self.pool, self.config.max_frame_len) {
                Ok(Some(request)) => {
                    conn.begin_request();
                    self.stats.requests += 1;
                    self.dispatch(token, request);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(token = %token, peer = %conn.peer(), error = %e, "malformed frame; closing");
                    self.stats.protocol_errors += 1;
                    self.close(token);
                    return false;
                }
            }
        }
        true
    }

    fn dispatch(&self, token: Token, request: Request) {
        let request_id = request.request_id;
        let shared = Arc::clone(&self.shared);
        let completer = Completer::new(move |outcome| {
            shared.submit(ReactorTask::Complete {
                token,
                request_id,
                outcome,
            });
        });

        // Unknown operation codes never reach the dispatcher.
        if let Err(ProtocolError::UnsupportedOperation(code)) = request.operation() {
            debug!(token = %token, request_id, op = code, "unsupported operation");
            completer.fail(DispatchError::UnsupportedOperation(code));
            return;
        }
        self.dispatcher.dispatch(request, completer);
    }

    fn drain_tasks(&mut self) {
        while let Some(task) = self.shared.tasks.pop() {
            match task {
                ReactorTask::Complete {
                    token,
                    request_id,
                    outcome,
                } => self.complete(token, request_id, outcome),
            }
        }
    }

    fn complete(&mut self, token: Token, request_id: i32, outcome: DispatchResult) {
        let verbose = self.config.verbose_errors;
        let Some(conn) = self.conns.get_mut(token) else {
            self.stats.stale += 1;
            debug!(token = %token, request_id, "connection gone; dropping response");
            return;
        };

        let response = match outcome {
            Ok(body) => Response::success(request_id, body),
            Err(e) => {
                debug!(token = %token, request_id, error = %e, "request failed");
                Response::failure(request_id, &e, verbose)
            }
        };
        conn.complete_request(response.encode());
        self.stats.responses += 1;

        if self.flush(token) {
            self.refresh(token);
        }
    }

    /// Returns `false` if the connection was closed.
    fn flush(&mut self, token: Token) -> bool {
        let Some(conn) = self.conns.get_mut(token) else {
            return false;
        };
        match conn.flush() {
            Ok(_) => true,
            Err(e) => {
                debug!(token = %token, error = %e, "write failed");
                self.close(token);
                false
            }
        }
    }

    /// Re-arm epoll to match what the connection needs, or close it
    /// once it is half-closed and fully answered.
    fn refresh(&mut self, token: Token) {
        let resume = match self.conns.get(token) {
            Some(conn) => conn.can_resume(),
            None => return,
        };
        if resume && !self.decode(token) {
            return;
        }
        let Some(conn) = self.conns.get_mut(token) else {
            return;
        };
        if conn.is_finished() {
            self.close(token);
            return;
        }
        let want = conn.desired_interest();
        if want == conn.interest() {
            return;
        }
        let mut ev = EpollEvent::new(interest_flags(want), token.0);
        match self.epoll.modify(conn.stream(), &mut ev) {
            Ok(()) => conn.set_interest(want),
            Err(e) => {
                warn!(token = %token, error = %e, "epoll modify failed");
                self.close(token);
            }
        }
    }

    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(token) else {
            return;
        };
        if let Err(e) = self.epoll.delete(conn.stream()) {
            debug!(token = %token, error = %e, "epoll delete failed");
        }
        if conn.in_flight() > 0 {
            debug!(token = %token, in_flight = conn.in_flight(), "closing with requests in flight");
        }
        conn.release(&mut self.pool);
        self.stats.closed += 1;
        debug!(token = %token, peer = %conn.peer(), "closed");
    }

    fn close_all(&mut self) {
        for token in self.conns.tokens() {
            self.close(token);
        }
        // Completions that raced shutdown have nowhere to go.
        while self.shared.tasks.pop().is_some() {
            self.stats.stale += 1;
        }
    }
}

fn interest_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.read {
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    }
    if interest.write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatdb_core::protocol::Operation;
    use flatdb_core::PartitionId;
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Echoes the body back, recording what it saw.
    struct Echo {
        seen: Mutex<Vec<Request>>,
    }

    impl Dispatcher for Echo {
        fn dispatch(&self, request: Request, completer: Completer) {
            let body = request.body.clone();
            self.seen.lock().unwrap().push(request);
            completer.succeed(body);
        }
    }

    fn test_config() -> ReactorConfig {
        ReactorConfig {
            bind_addr: Ipv4Addr::LOCALHOST,
            port: 0,
            buffer_size: 8,
            poll_timeout_ms: 10,
            ..ReactorConfig::default()
        }
    }

    fn start_with(config: ReactorConfig) -> (Reactor, Arc<Echo>) {
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let reactor = Reactor::start(config, echo.clone()).unwrap();
        (reactor, echo)
    }

    fn start() -> (Reactor, Arc<Echo>) {
        start_with(test_config())
    }

    fn connect(reactor: &Reactor) -> TcpStream {
        let stream = TcpStream::connect(reactor.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    #[test]
    fn test_echo_across_small_buffers() {
        let (reactor, echo) = start();
        let mut client = connect(&reactor);
        let req = Request::new(11, Operation::Read, PartitionId(3), b"a body longer than one buffer".to_vec());
        client.write_all(&req.encode()).unwrap();

        let resp = Response::read_from(&mut client).unwrap();
        assert_eq!(resp.request_id, 11);
        assert!(resp.is_success());
        assert_eq!(resp.body, req.body);
        assert_eq!(echo.seen.lock().unwrap().as_slice(), &[req]);
    }

    #[test]
    fn test_unsupported_operation_skips_dispatcher() {
        let (reactor, echo) = start();
        let mut client = connect(&reactor);
        let req = Request::with_op_code(4, 9, PartitionId(1), Vec::new());
        client.write_all(&req.encode()).unwrap();

        let resp = Response::read_from(&mut client).unwrap();
        assert_eq!(resp.request_id, 4);
        assert!(!resp.is_success());
        let text = String::from_utf8(resp.body).unwrap();
        assert!(text.contains("Unsupported operation 9"), "{text}");
        assert!(echo.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_frame_closes_connection() {
        let (reactor, _echo) = start();
        let mut client = connect(&reactor);
        client.write_all(&3i32.to_be_bytes()).unwrap();
        let mut buf = [0u8; 1];
        let n = std::io::Read::read(&mut client, &mut buf).unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut reactor, _echo) = start();
        assert!(reactor.is_running());
        reactor.shutdown();
        reactor.shutdown();
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_slow_reader_is_throttled_then_served() {
        let (reactor, echo) = start_with(ReactorConfig {
            buffer_size: 4096,
            max_outbound_bytes: 64 * 1024,
            max_in_flight: 64,
            ..test_config()
        });
        let mut client = connect(&reactor);

        const BODY: usize = 1000;
        const FRAMES: usize = 64 * 1024;
        let mut wire = Vec::new();
        for id in 0..FRAMES {
            Request::new(id as i32, Operation::Read, PartitionId(1), vec![id as u8; BODY]).encode_into(&mut wire);
        }
        let frame_len = wire.len() / FRAMES;

        // Push without ever reading responses until the server stops
        // taking bytes.
        client.set_nonblocking(true).unwrap();
        let mut sent = 0;
        let mut idle_rounds = 0;
        while sent < wire.len() && idle_rounds < 50 {
            match client.write(&wire[sent..]) {
                Ok(n) => {
                    sent += n;
                    idle_rounds = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    idle_rounds += 1;
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("write failed: {e}"),
            }
        }
        assert!(sent < wire.len(), "server consumed all {} bytes", wire.len());
        let dispatched = echo.seen.lock().unwrap().len();
        assert!(dispatched < FRAMES, "dispatched {dispatched}");

        // Once responses are collected the connection resumes.
        client.set_nonblocking(false).unwrap();
        let expected = sent.div_ceil(frame_len);
        let mut reader = client.try_clone().unwrap();
        let collect = thread::spawn(move || {
            for id in 0..expected {
                let resp = Response::read_from(&mut reader).unwrap();
                assert_eq!(resp.request_id, id as i32);
                assert_eq!(resp.body.len(), BODY);
            }
        });
        client.write_all(&wire[sent..expected * frame_len]).unwrap();
        collect.join().unwrap();
        assert_eq!(echo.seen.lock().unwrap().len(), expected);
    }
}
