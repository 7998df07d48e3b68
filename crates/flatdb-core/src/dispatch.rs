//! Reactor ↔ dispatch-fabric seam.
//!
//! The reactor hands every decoded [`Request`] to a [`Dispatcher`]
//! together with a [`Completer`]. The dispatcher may complete it on any
//! thread; the reactor is responsible for marshalling the outcome back
//! onto its own thread before touching the socket.

use std::fmt;

use crate::error::DispatchError;
use crate::protocol::Request;

/// Outcome of a dispatched request: the success body or the failure.
pub type DispatchResult = Result<Vec<u8>, DispatchError>;

/// Routes requests to partitions.
///
/// **Contract:**
/// - `dispatch()` must NEVER block on backend work.
/// - The completer is invoked exactly once. Dropping it without
///   invoking it completes the request with [`DispatchError::Abandoned`].
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: Request, completer: Completer);
}

type Callback = Box<dyn FnOnce(DispatchResult) + Send>;

/// One-shot completion callback.
///
/// Guarantees a response for every dispatched request: if the owning
/// job is dropped (context shut down, queue discarded) the callback
/// still fires with [`DispatchError::Abandoned`].
pub struct Completer {
    callback: Option<Callback>,
}

impl Completer {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(DispatchResult) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: DispatchResult) {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
    }

    pub fn succeed(self, body: Vec<u8>) {
        self.complete(Ok(body));
    }

    pub fn fail(self, error: DispatchError) {
        self.complete(Err(error));
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.take() {
            cb(Err(DispatchError::Abandoned));
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<DispatchResult>>>, Completer) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let completer = Completer::new(move |r| sink.lock().unwrap().push(r));
        (seen, completer)
    }

    #[test]
    fn test_complete_once() {
        let (seen, completer) = recorder();
        completer.succeed(b"ok".to_vec());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap(), b"ok");
    }

    #[test]
    fn test_drop_abandons() {
        let (seen, completer) = recorder();
        drop(completer);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Err(DispatchError::Abandoned)));
    }
}
