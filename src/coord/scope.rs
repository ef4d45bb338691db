use std::fmt;
use tracing::{error, warn};

use crate::context::StateToken;
use crate::coord::coordinator::TransactionCoordinator;
use crate::coord::stack::TransactionId;
use crate::core::errors::Result;

/// How leaving a scope affected the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeExit {
    /// An outer scope is still open; no manager call was made
    Nested,
    /// Outermost exit, transaction finished
    Finished,
    /// Outermost exit, transaction cancelled
    Cancelled,
    /// The transaction was already cancelled by `cancel_all`
    Detached,
}

/// Guard for one entered action group
///
/// Call `release` for a normal exit or `abort` to cancel. A handle dropped
/// without either (early return, panic) exits as a cancel.
#[must_use = "dropping a scope handle without release() cancels the transaction"]
pub struct ScopeHandle<'a> {
    coordinator: &'a TransactionCoordinator,
    key: StateToken,
    transaction: TransactionId,
    released: bool,
}

impl<'a> ScopeHandle<'a> {
    pub(crate) fn new(coordinator: &'a TransactionCoordinator, key: StateToken, transaction: TransactionId) -> Self {
        Self {
            coordinator,
            key,
            transaction,
            released: false,
        }
    }

    pub fn state_token(&self) -> &StateToken {
        &self.key
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Depth of the Context right now, 0 once detached
    pub fn depth(&self) -> usize {
        self.coordinator.depth_of(&self.key)
    }

    /// Mark the transaction for cancellation while staying in scope. The
    /// outermost exit will cancel instead of finish.
    pub fn cancel(&self) -> bool {
        self.coordinator.poison(&self.key, self.transaction)
    }

    /// Leave the scope normally
    pub fn release(mut self) -> Result<ScopeExit> {
        self.exit(false)
    }

    /// Leave the scope and cancel the transaction
    pub fn abort(mut self) -> Result<ScopeExit> {
        self.exit(true)
    }

    fn exit(&mut self, cancel: bool) -> Result<ScopeExit> {
        self.released = true;
        self.coordinator.exit_scope(&self.key, self.transaction, cancel)
    }
}

impl Drop for ScopeHandle<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let reason = if std::thread::panicking() { "panic" } else { "no release" };
        warn!(
            "Action group {} for state {} dropped ({}), cancelling",
            self.transaction, self.key, reason
        );
        if let Err(e) = self.exit(true) {
            error!("Failed to exit action group for state {} on drop: {}", self.key, e);
        }
    }
}

impl fmt::Debug for ScopeHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("state", &self.key)
            .field("transaction", &self.transaction)
            .field("released", &self.released)
            .finish()
    }
}
