//! Shutdown coordination.
//!
//! Every node watches a [`Shutdown`] signal.  A pool owns the root signal
//! and hands each of its nodes a child, so shutting the pool down reaches
//! every node while disconnecting one node leaves its siblings running.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires when `self` does, but can also fire on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn signal(&self) {
        self.token.cancel();
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub fn signaled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
