//! Cooperative cancellation handle for agent work

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Cancellation handle shared by a plan, its task attempts, and their tool
/// calls. Cancelling a parent cancels every child derived from it.
#[derive(Debug, Clone, Default)]
pub struct AgentCancellation {
    token: CancellationToken,
}

impl AgentCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle cancelled together with this one, but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
