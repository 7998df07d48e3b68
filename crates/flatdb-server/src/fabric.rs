//! Partition dispatch fabric.
//!
//! Maps every partition to exactly one execution context and tracks the
//! partition's lifecycle state. The set of partitions is fixed when the
//! fabric is built.
//!
//! ```text
//!   partition 1 ─┐
//!   partition 3 ─┼─► ctx-0   (context_threads = 2)
//!   partition 5 ─┘
//!   partition 2 ─┬─► ctx-1
//!   partition 4 ─┘
//! ```
//!
//! With `context_threads = 0` every partition gets its own context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use flatdb_core::{Backend, DispatchError, PartitionId};

use crate::context::{BackendSet, ExecutionContext};
use crate::error::ServerError;

/// Lifecycle of one partition.
///
/// ```text
///   Uninitialized ─► Starting ─► Started ─► Stopping ─► Stopped
///                       │           ▲          │
///                       ▼           └──────────┘ (close failed)
///                     Failed
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    Uninitialized = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
    /// `open` failed; the partition rejects requests.
    Failed = 5,
}

impl PartitionState {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// A `start` may (re)open the partition from this state.
    #[inline]
    pub fn can_start(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

struct PartitionSlot {
    context: usize,
    state: AtomicU8,
}

pub struct DispatchFabric {
    contexts: Vec<ExecutionContext>,
    partitions: BTreeMap<PartitionId, PartitionSlot>,
}

impl DispatchFabric {
    /// Distribute `backends` over execution contexts and spawn them.
    ///
    /// `context_threads == 0` gives each partition a dedicated context;
    /// otherwise partitions are assigned round-robin over
    /// `min(context_threads, partitions)` contexts.
    pub fn new(
        backends: Vec<(PartitionId, Box<dyn Backend>)>,
        context_threads: usize,
    ) -> Result<Self, ServerError> {
        let mut sorted: BTreeMap<PartitionId, Box<dyn Backend>> = BTreeMap::new();
        for (partition, backend) in backends {
            if sorted.insert(partition, backend).is_some() {
                return Err(ServerError::DuplicatePartition(partition));
            }
        }

        let count = match context_threads {
            0 => sorted.len(),
            n => n.min(sorted.len()),
        };
        let mut sets: Vec<BackendSet> = (0..count).map(|_| BackendSet::new()).collect();
        let mut partitions = BTreeMap::new();
        for (i, (partition, backend)) in sorted.into_iter().enumerate() {
            let context = i % count.max(1);
            sets[context].insert(partition, backend);
            partitions.insert(
                partition,
                PartitionSlot {
                    context,
                    state: AtomicU8::new(PartitionState::Uninitialized as u8),
                },
            );
            debug!(partition = %partition, context, "partition assigned");
        }

        let mut contexts = Vec::with_capacity(count);
        for (id, set) in sets.into_iter().enumerate() {
            contexts.push(ExecutionContext::spawn(id, set).map_err(ServerError::Spawn)?);
        }

        Ok(Self {
            contexts,
            partitions,
        })
    }

    /// Configured partitions, ascending.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.keys().copied()
    }

    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.partitions
            .get(&partition)
            .map(|slot| PartitionState::from_u8(slot.state.load(Ordering::Acquire)))
    }

    pub(crate) fn set_state(&self, partition: PartitionId, state: PartitionState) {
        if let Some(slot) = self.partitions.get(&partition) {
            slot.state.store(state as u8, Ordering::Release);
        }
    }

    /// Move `partition` from `from` to `to` if nobody else moved it
    /// first. Returns `false` if the state was not `from`.
    pub(crate) fn transition(&self, partition: PartitionId, from: PartitionState, to: PartitionState) -> bool {
        self.partitions.get(&partition).map_or(false, |slot| {
            slot.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Index of the context serving `partition`.
    pub fn context_of(&self, partition: PartitionId) -> Option<usize> {
        self.partitions.get(&partition).map(|slot| slot.context)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Run `op` against `partition`'s backend on its context, after
    /// everything already queued there.
    ///
    /// If the context is closed, `op` is dropped unrun and
    /// `ContextClosed` is returned.
    pub fn submit<F>(&self, partition: PartitionId, op: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut dyn Backend) + Send + 'static,
    {
        let slot = self
            .partitions
            .get(&partition)
            .ok_or(DispatchError::UnknownPartition(partition))?;
        let context = self
            .contexts
            .get(slot.context)
            .ok_or(DispatchError::ContextClosed(partition))?;
        let accepted = context.submit(Box::new(move |set: &mut BackendSet| {
            if let Some(backend) = set.get_mut(partition) {
                op(backend.as_mut());
            }
        }));
        if accepted {
            Ok(())
        } else {
            Err(DispatchError::ContextClosed(partition))
        }
    }

    /// Finish queued jobs and join every context thread.
    pub fn shutdown(&mut self) {
        for ctx in &mut self.contexts {
            ctx.shutdown();
            debug!(context = ctx.id(), jobs = ctx.executed(), "context stopped");
        }
    }
}
