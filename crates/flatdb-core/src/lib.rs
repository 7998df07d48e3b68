//! # flatdb-core — Trait definitions and wire types for FlatDB
//!
//! This crate defines the boundaries every other FlatDB crate programs
//! against. It does no I/O and spawns no threads.
//!
//! - [`protocol`]: request/response envelopes and their binary framing
//! - [`backend`]: the capability contract a storage plugin implements
//! - [`dispatch`]: the seam between the network reactor and the
//!   partition dispatch fabric
//! - [`error`]: the error taxonomy shared across crates
//!
//! ## Design principle
//!
//! > "Program to the interface."
//!
//! The reactor never names the server crate and the server crate never
//! names a socket. Both meet at [`dispatch::Dispatcher`].

pub mod env;
pub mod error;
pub mod partition;
pub mod protocol;
pub mod backend;
pub mod dispatch;

pub use backend::{Backend, BackendResult};
pub use dispatch::{Completer, DispatchResult, Dispatcher};
pub use error::{BackendError, DispatchError, ErrorKind, ProtocolError};
pub use partition::PartitionId;
pub use protocol::{Operation, Request, Response, ResponseKind};
