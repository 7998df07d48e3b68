//! `BufferPool` — recycles fixed-size transfer buffers.
//!
//! Owned by the reactor thread; never shared, so no locking. A buffer
//! is exclusively owned by whoever acquired it until it is released.
//!
//! Buffers are reset when they come back, not when they go out. A bug
//! that reads stale bytes shows up as stale bytes instead of zeros.
//!
//! Idle buffers beyond `max_idle` are freed on release so a burst of
//! oversized messages does not pin memory forever.

/// Fixed-capacity byte buffer. `filled` marks how many leading bytes
/// hold data; the rest is spare room for the next read.
pub struct PooledBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl PooledBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Bytes written so far.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Room left for the next read.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` spare bytes as written.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len());
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.filled);
        self.data[self.filled..self.filled + n].copy_from_slice(&src[..n]);
        self.filled += n;
        n
    }

    #[inline]
    fn reset(&mut self) {
        self.filled = 0;
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("filled", &self.filled)
            .finish()
    }
}

pub struct BufferPool {
    /// Capacity of every buffer handed out.
    buffer_size: usize,
    /// Idle buffers beyond this count are dropped on release.
    max_idle: usize,
    idle: Vec<PooledBuffer>,
    /// Buffers currently checked out (for diagnostics).
    in_use: usize,
    /// Buffers ever allocated (for diagnostics).
    allocated: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Vec::new(),
            in_use: 0,
            allocated: 0,
        }
    }

    /// Take an idle buffer, or allocate one if none is idle.
    pub fn acquire(&mut self) -> PooledBuffer {
        self.in_use += 1;
        match self.idle.pop() {
            Some(buf) => buf,
            None => {
                self.allocated += 1;
                PooledBuffer::new(self.buffer_size)
            }
        }
    }

    /// Reset `buf` and return it to the idle set.
    pub fn release(&mut self, mut buf: PooledBuffer) {
        self.in_use = self.in_use.saturating_sub(1);
        if buf.capacity() != self.buffer_size || self.idle.len() >= self.max_idle {
            return;
        }
        buf.reset();
        self.idle.push(buf);
    }

    /// Release every buffer yielded by `bufs`.
    pub fn release_all<I>(&mut self, bufs: I)
    where
        I: IntoIterator<Item = PooledBuffer>,
    {
        for buf in bufs {
            self.release(buf);
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}
