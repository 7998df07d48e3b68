//! # flatdb-server — partitions, execution contexts, lifecycle
//!
//! ```text
//!   Reactor ──dispatch()──► DataServer ──► DispatchFabric
//!                               │              │
//!                         start/stop      ctx-0  ctx-1  ...
//!                                          │      │
//!                                       backends backends
//! ```
//!
//! - [`config`]: `server.conf` parsing, env overrides, validation
//! - [`context`]: serialized execution contexts (one thread each)
//! - [`fabric`]: partition → context mapping and partition state
//! - [`lifecycle`]: [`DataServer`], the orchestrator and dispatcher
//! - [`completion`]: futures returned by `read`/`write`
//! - [`backends`]: backend registry and the built-in `list` backend

pub mod backends;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod fabric;
pub mod lifecycle;

pub use backends::{BackendRegistry, ListBackend};
pub use completion::{Completion, Outcome, Resolver};
pub use config::{ServerConfig, DEFAULT_CONFIG_FILE};
pub use context::{BackendSet, ExecutionContext};
pub use error::{ConfigError, LifecycleError, PartitionFailure, ServerError};
pub use fabric::{DispatchFabric, PartitionState};
pub use lifecycle::DataServer;
