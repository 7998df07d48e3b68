//! # FlatDB — partitioned data server
//!
//! One process serves a fixed set of partitions over TCP. Each request
//! names a partition; the partition's backend runs it on a dedicated,
//! serialized execution context and the reactor writes the answer back.
//!
//! ## Quick start
//!
//! ```ignore
//! use flatdb::{BackendRegistry, Node, ServerConfig};
//!
//! let config = ServerConfig::load("server.conf")?;
//! let mut node = Node::start(&config, &BackendRegistry::default())?;
//! println!("listening on {}", node.local_addr());
//! // ...
//! node.shutdown()?;
//! ```
//!
//! ## Crates
//!
//! | crate | contents |
//! |---|---|
//! | `flatdb-core` | wire protocol, backend trait, dispatcher seam, errors |
//! | `flatdb-net` | buffer pool, reassembly, epoll reactor |
//! | `flatdb-server` | config, execution contexts, dispatch fabric, lifecycle |
//! | `flatdb-ipc` | named-pipe byte channel |

pub mod client;
mod node;

pub use client::Client;
pub use node::{reactor_config, Node, NodeError};

pub use flatdb_core::{
    Backend, BackendError, BackendResult, Completer, DispatchError, DispatchResult, Dispatcher,
    ErrorKind, Operation, PartitionId, ProtocolError, Request, Response, ResponseKind,
};
pub use flatdb_ipc::{IpcError, PipeChannel, Role};
pub use flatdb_net::{NetError, Reactor, ReactorConfig};
pub use flatdb_server::{
    BackendRegistry, Completion, ConfigError, DataServer, LifecycleError, ListBackend,
    PartitionState, ServerConfig, ServerError, DEFAULT_CONFIG_FILE,
};
