//! Per-connection frame reassembly.
//!
//! Bytes arrive in whatever pieces TCP feels like. They are read into
//! pooled buffers; when a buffer fills, it is chained and a fresh one
//! is acquired, so a single frame may span many buffers:
//!
//! ```text
//!   chain:  [ ####### ][ ####### ][ ###.... ]
//!              ^head                   ^filled  (spare)
//! ```
//!
//! `next_frame` walks the chain from `head`, copying the size prefix,
//! the fixed header and the body out across buffer boundaries. Buffers
//! are returned to the pool as soon as every byte in them is consumed,
//! so an idle connection holds no buffers at all.
//!
//! The whole frame is buffered before it is decoded; there is no
//! streaming parse. `max_frame_len` bounds what one frame can pin.

use std::collections::VecDeque;
use std::io::{self, Read};

use flatdb_core::error::ProtocolError;
use flatdb_core::protocol::{check_frame_len, Request, REQUEST_HEADER_LEN, SIZE_PREFIX_LEN};

use crate::pool::{BufferPool, PooledBuffer};

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the 4-byte size prefix.
    AwaitingSize,
    /// Size prefix consumed; waiting for `frame_len` more bytes.
    AwaitingBody { frame_len: usize },
}

/// Result of one `fill_from` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fill {
    /// Bytes appended to the chain.
    pub bytes: usize,
    /// The peer closed its write side.
    pub eof: bool,
}

pub struct Reassembly {
    chain: VecDeque<PooledBuffer>,
    /// Bytes already consumed from the front buffer.
    head: usize,
    /// Unconsumed bytes across the whole chain.
    buffered: usize,
    state: ReadState,
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembly {
    pub fn new() -> Self {
        Self {
            chain: VecDeque::new(),
            head: 0,
            buffered: 0,
            state: ReadState::AwaitingSize,
        }
    }

    #[inline]
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Unconsumed bytes held.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Physical buffers currently chained.
    #[inline]
    pub fn buffers(&self) -> usize {
        self.chain.len()
    }

    /// True while part of a frame is held.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.buffered > 0 || self.state != ReadState::AwaitingSize
    }

    /// Read from `reader` until it would block, reports EOF, or `limit`
    /// bytes have been taken.
    pub fn fill_from<R: Read>(
        &mut self,
        reader: &mut R,
        pool: &mut BufferPool,
        limit: usize,
    ) -> io::Result<Fill> {
        let mut fill = Fill::default();
        let result = loop {
            if fill.bytes >= limit {
                break Ok(());
            }
            if self.chain.back().map_or(true, PooledBuffer::is_full) {
                self.chain.push_back(pool.acquire());
            }
            let tail = match self.chain.back_mut() {
                Some(tail) => tail,
                None => break Ok(()),
            };
            match reader.read(tail.spare_mut()) {
                Ok(0) => {
                    fill.eof = true;
                    break Ok(());
                }
                Ok(n) => {
                    tail.advance(n);
                    self.buffered += n;
                    fill.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.trim_empty_tail(pool);
        result.map(|()| fill)
    }

    /// Append bytes that are already in memory.
    pub fn extend_from_slice(&mut self, mut src: &[u8], pool: &mut BufferPool) {
        while !src.is_empty() {
            if self.chain.back().map_or(true, PooledBuffer::is_full) {
                self.chain.push_back(pool.acquire());
            }
            if let Some(tail) = self.chain.back_mut() {
                let n = tail.put(src);
                self.buffered += n;
                src = &src[n..];
            }
        }
    }

    /// Decode the next complete request, if one is fully buffered.
    ///
    /// A framing error leaves the reassembly in an undefined position;
    /// the caller must drop the connection.
    pub fn next_frame(
        &mut self,
        pool: &mut BufferPool,
        max_frame_len: usize,
    ) -> Result<Option<Request>, ProtocolError> {
        let frame_len = match self.state {
            ReadState::AwaitingSize => {
                if self.buffered < SIZE_PREFIX_LEN {
                    return Ok(None);
                }
                let mut prefix = [0u8; SIZE_PREFIX_LEN];
                self.copy_out(&mut prefix, pool);
                let frame_len = check_frame_len(i32::from_be_bytes(prefix), max_frame_len)?;
                self.state = ReadState::AwaitingBody { frame_len };
                frame_len
            }
            ReadState::AwaitingBody { frame_len } => frame_len,
        };

        if self.buffered < frame_len {
            return Ok(None);
        }

        let mut header = [0u8; REQUEST_HEADER_LEN];
        self.copy_out(&mut header, pool);
        let mut body = vec![0u8; frame_len - REQUEST_HEADER_LEN];
        self.copy_out(&mut body, pool);
        self.state = ReadState::AwaitingSize;

        let (request_id, op_code, partition) = Request::parse_header(&header);
        Ok(Some(Request {
            request_id,
            op_code,
            partition,
            body,
        }))
    }

    /// Return every held buffer to the pool and forget partial state.
    pub fn release(&mut self, pool: &mut BufferPool) {
        pool.release_all(self.chain.drain(..));
        self.head = 0;
        self.buffered = 0;
        self.state = ReadState::AwaitingSize;
    }

    /// Consume exactly `dst.len()` bytes from the front of the chain.
    /// Caller checks `buffered` first.
    fn copy_out(&mut self, dst: &mut [u8], pool: &mut BufferPool) {
        let mut written = 0;
        while written < dst.len() {
            let (n, exhausted) = {
                let front = match self.chain.front() {
                    Some(front) => front,
                    None => break,
                };
                let available = &front.filled()[self.head..];
                let n = available.len().min(dst.len() - written);
                dst[written..written + n].copy_from_slice(&available[..n]);
                (n, self.head + n == front.len())
            };
            written += n;
            self.head += n;
            self.buffered -= n;
            // Everything written to the front buffer has been consumed.
            // Pop it even if it is also the tail; the next fill starts a
            // fresh buffer.
            if exhausted {
                if let Some(buf) = self.chain.pop_front() {
                    pool.release(buf);
                }
                self.head = 0;
            }
        }
        debug_assert_eq!(written, dst.len());
    }

    fn trim_empty_tail(&mut self, pool: &mut BufferPool) {
        let empty_tail = self.chain.back().map_or(false, PooledBuffer::is_empty);
        if empty_tail {
            if let Some(buf) = self.chain.pop_back() {
                pool.release(buf);
            }
        }
    }
}
