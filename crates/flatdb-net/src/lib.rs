//! FlatDB network engine.
//!
//! A single-threaded epoll reactor that owns every client socket:
//!
//! - [`pool`]: recycled fixed-size read buffers
//! - [`reassembly`]: per-connection buffer chains and frame decoding
//! - [`conn`]: connection state plus a generation-tagged slab
//! - [`notifier`]: eventfd waker for cross-thread completions
//! - [`listener`]: listening socket with `SO_REUSEADDR` and a backlog
//! - [`reactor`]: the event loop itself
//!
//! Requests go out through [`flatdb_core::Dispatcher`]; responses come
//! back through the reactor's task queue and are written on the
//! reactor thread only.

pub mod conn;
pub mod error;
pub mod listener;
pub mod notifier;
pub mod pool;
pub mod reactor;
pub mod reassembly;

pub use conn::{ConnSlab, Connection, OutboundLimit, Token};
pub use error::NetError;
pub use pool::{BufferPool, PooledBuffer};
pub use reactor::{Reactor, ReactorConfig, ReactorTask};
pub use reassembly::{Fill, ReadState, Reassembly};
