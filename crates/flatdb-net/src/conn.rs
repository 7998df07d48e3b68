//! Per-connection state and the slab that owns it.
//!
//! Everything here lives on the reactor thread. Other threads only ever
//! see a [`Token`], which they hand back through the task queue along
//! with a finished response.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use flatdb_core::error::ProtocolError;
use flatdb_core::protocol::Request;

use crate::pool::BufferPool;
use crate::reassembly::{Fill, Reassembly};

// ── Tokens ──

/// Slab slot handle: `(generation << 32) | index`.
///
/// The generation is bumped every time a slot is freed, so a
/// completion for a connection that has since closed (and whose slot
/// was reused) is recognised as stale instead of being written to the
/// wrong peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl Token {
    #[inline]
    fn new(generation: u32, index: usize) -> Self {
        Token(((generation as u64) << 32) | (index as u64 & 0xFFFF_FFFF))
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

// ── Slab ──

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct ConnSlab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for ConnSlab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnSlab<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Token {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.value = Some(value);
                Token::new(slot.generation, idx)
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Token::new(0, idx)
            }
        }
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        let slot = self.slots.get(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn remove(&mut self, token: Token) -> Option<T> {
        let idx = token.index();
        let slot = self.slots.get_mut(idx)?;
        if slot.generation != token.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        self.len -= 1;
        Some(value)
    }

    /// Tokens of all live entries.
    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| Token::new(s.generation, i))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ── Connection ──

/// Readiness a connection is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

/// Per-connection limits on work the peer has not yet collected.
///
/// Once either limit is reached the connection stops reading and
/// decoding until `flush` and completions bring it back under. The
/// peer's unread requests stay in its socket buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundLimit {
    /// Encoded response bytes queued but not yet written.
    pub max_bytes: usize,
    /// Requests dispatched and not yet completed.
    pub max_in_flight: usize,
}

impl Default for OutboundLimit {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024,
            max_in_flight: 1024,
        }
    }
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    reassembly: Reassembly,
    /// Encoded responses waiting for the socket to accept them.
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front outbound frame already written.
    written: usize,
    /// Unwritten bytes across the whole outbound queue.
    outbound_bytes: usize,
    limit: OutboundLimit,
    /// Decoding stopped at the limit with bytes still buffered.
    stalled: bool,
    /// Requests dispatched whose completion has not come back yet.
    in_flight: usize,
    /// Peer shut down its write side; no more requests will arrive.
    read_closed: bool,
    /// What the poller currently reports for this connection.
    interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, limit: OutboundLimit) -> Self {
        Self {
            stream,
            peer,
            reassembly: Reassembly::new(),
            outbound: VecDeque::new(),
            written: 0,
            outbound_bytes: 0,
            limit,
            stalled: false,
            in_flight: 0,
            read_closed: false,
            interest: Interest {
                read: true,
                write: false,
            },
        }
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Pull whatever the socket has into the reassembly chain.
    pub fn read_ready(&mut self, pool: &mut BufferPool, limit: usize) -> io::Result<Fill> {
        let fill = self.reassembly.fill_from(&mut self.stream, pool, limit)?;
        if fill.eof {
            self.read_closed = true;
        }
        Ok(fill)
    }

    /// Next complete request, or `None` if none is buffered or the
    /// connection is over its outbound limit.
    pub fn next_request(
        &mut self,
        pool: &mut BufferPool,
        max_frame_len: usize,
    ) -> Result<Option<Request>, ProtocolError> {
        if self.is_backlogged() {
            self.stalled = self.reassembly.is_pending();
            return Ok(None);
        }
        let next = self.reassembly.next_frame(pool, max_frame_len)?;
        if next.is_none() {
            self.stalled = false;
        }
        Ok(next)
    }

    /// Queued output or outstanding requests have reached the limit.
    pub fn is_backlogged(&self) -> bool {
        self.outbound_bytes >= self.limit.max_bytes || self.in_flight >= self.limit.max_in_flight
    }

    /// Buffered requests were left undecoded and the limit has since
    /// cleared.
    pub fn can_resume(&self) -> bool {
        self.stalled && !self.is_backlogged()
    }

    #[inline]
    pub fn outbound_bytes(&self) -> usize {
        self.outbound_bytes
    }

    /// A request was handed to the dispatcher.
    #[inline]
    pub fn begin_request(&mut self) {
        self.in_flight += 1;
    }

    /// Queue an encoded response and retire one in-flight request.
    pub fn complete_request(&mut self, frame: Vec<u8>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.queue(frame);
    }

    /// Queue an encoded frame that does not correspond to a dispatch.
    pub fn queue(&mut self, frame: Vec<u8>) {
        if !frame.is_empty() {
            self.outbound_bytes += frame.len();
            self.outbound.push_back(frame);
        }
    }

    /// Write queued frames until done or the socket would block.
    /// Returns `true` when the outbound queue is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.outbound.front() {
            match self.stream.write(&front[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    self.outbound_bytes -= n;
                    if self.written == front.len() {
                        self.outbound.pop_front();
                        self.written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    #[inline]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    pub fn read_closed(&self) -> bool {
        self.read_closed
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Stop reading once the peer is done or while backlogged; ask for
    /// writability only while output is queued.
    pub fn desired_interest(&self) -> Interest {
        Interest {
            read: !self.read_closed && !self.is_backlogged(),
            write: self.has_outbound(),
        }
    }

    /// Half-closed and nothing left to decode or deliver.
    pub fn is_finished(&self) -> bool {
        self.read_closed && !self.stalled && self.in_flight == 0 && !self.has_outbound()
    }

    /// Return the reassembly buffers to the pool. Call before dropping.
    pub fn release(&mut self, pool: &mut BufferPool) {
        self.reassembly.release(pool);
        self.outbound.clear();
        self.written = 0;
        self.outbound_bytes = 0;
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
