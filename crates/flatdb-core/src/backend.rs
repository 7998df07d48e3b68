//! Backend plugin contract.
//!
//! A `Backend` holds the data for exactly one partition. The dispatch
//! fabric guarantees:
//!
//! - every call for a partition runs on that partition's execution
//!   context, one at a time, in submission order;
//! - the instance is never shared between contexts.
//!
//! The contract does NOT promise that consecutive calls arrive on the
//! same OS thread. A backend may hold `!Sync` state but must be `Send`.
//!
//! # Implementors
//!
//! - `ListBackend` (flatdb-server): in-memory append-only list, used by
//!   the `list` selector and the end-to-end tests.
//!
//! Read-only or write-only backends only override the half they
//! support; the other half fails with [`BackendError::Unsupported`].

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::BackendError;
use crate::partition::PartitionId;

pub type BackendResult<T> = Result<T, BackendError>;

/// Storage plugin for a single partition.
pub trait Backend: Send {
    /// Open the store backing `partition` of database `db_name`.
    fn open<'a>(
        &'a mut self,
        _db_name: &'a str,
        _partition: PartitionId,
    ) -> BoxFuture<'a, BackendResult<()>> {
        future::ready(Ok(())).boxed()
    }

    /// Release everything acquired by `open`.
    fn close(&mut self) -> BoxFuture<'_, BackendResult<()>> {
        future::ready(Ok(())).boxed()
    }

    /// Execute a read. The returned bytes become the success body.
    fn read(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<Vec<u8>>> {
        future::ready(Err(BackendError::Unsupported)).boxed()
    }

    /// Execute a write. Success responses for writes carry an empty body.
    fn write(&mut self, _body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        future::ready(Err(BackendError::Unsupported)).boxed()
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn open<'a>(
        &'a mut self,
        db_name: &'a str,
        partition: PartitionId,
    ) -> BoxFuture<'a, BackendResult<()>> {
        (**self).open(db_name, partition)
    }

    fn close(&mut self) -> BoxFuture<'_, BackendResult<()>> {
        (**self).close()
    }

    fn read(&mut self, body: Vec<u8>) -> BoxFuture<'_, BackendResult<Vec<u8>>> {
        (**self).read(body)
    }

    fn write(&mut self, body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        (**self).write(body)
    }
}
