//! `Completion<T>` — the future returned by `read`/`write`/`open`.
//!
//! Resolved by the execution context that ran the operation. If that
//! side goes away without answering (context shut down, job panicked)
//! the completion resolves to [`DispatchError::Abandoned`] instead of
//! hanging.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::executor::block_on;

use flatdb_core::DispatchError;

pub type Outcome<T> = Result<T, DispatchError>;

/// Sending half, moved into the job.
pub struct Resolver<T> {
    tx: oneshot::Sender<Outcome<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, outcome: Outcome<T>) {
        // Receiver dropped: nobody is waiting, nothing to do.
        let _ = self.tx.send(outcome);
    }
}

#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(Option<Outcome<T>>),
    Pending(oneshot::Receiver<Outcome<T>>),
}

impl<T> Completion<T> {
    pub fn channel() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            Resolver { tx },
            Self {
                inner: Inner::Pending(rx),
            },
        )
    }

    /// Already resolved; used for failures detected before submission.
    pub fn ready(outcome: Outcome<T>) -> Self {
        Self {
            inner: Inner::Ready(Some(outcome)),
        }
    }

    pub fn failed(error: DispatchError) -> Self {
        Self::ready(Err(error))
    }

    /// Block the calling thread until resolved.
    ///
    /// Never call this from an execution context thread: the job that
    /// would resolve it may be queued behind the caller.
    pub fn wait(self) -> Outcome<T> {
        block_on(self)
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(outcome) => match outcome.take() {
                Some(outcome) => Poll::Ready(outcome),
                None => Poll::Ready(Err(DispatchError::Abandoned)),
            },
            Inner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(DispatchError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatdb_core::PartitionId;
    use std::thread;

    #[test]
    fn test_resolved_from_other_thread() {
        let (resolver, completion) = Completion::channel();
        let t = thread::spawn(move || resolver.resolve(Ok(42)));
        assert_eq!(completion.wait().unwrap(), 42);
        t.join().unwrap();
    }

    #[test]
    fn test_dropped_resolver_abandons() {
        let (resolver, completion) = Completion::<()>::channel();
        drop(resolver);
        assert!(matches!(completion.wait(), Err(DispatchError::Abandoned)));
    }

    #[test]
    fn test_ready() {
        let c = Completion::<()>::failed(DispatchError::UnknownPartition(PartitionId(9)));
        assert!(matches!(
            c.wait(),
            Err(DispatchError::UnknownPartition(PartitionId(9)))
        ));
        assert_eq!(Completion::ready(Ok("x")).wait().unwrap(), "x");
    }
}
