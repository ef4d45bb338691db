//! Action group nesting for a single Context
//!
//! The stack never talks to the manager. Each operation returns the
//! `Transition` it caused and the coordinator turns that into a manager call
//! after releasing its locks.

use std::fmt;
use tracing::warn;

use crate::context::StateToken;
use crate::core::errors::{BridgeError, Result};
use crate::manager::Boundary;

/// Identifies one manager-visible transaction within a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Manager-visible effect of a stack operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Depth changed without crossing 0 <-> 1
    None,
    Start(TransactionId),
    Finish(TransactionId),
    Cancel(TransactionId),
}

impl Transition {
    pub fn boundary(&self) -> Option<Boundary> {
        match self {
            Transition::None => None,
            Transition::Start(_) => Some(Boundary::Start),
            Transition::Finish(_) => Some(Boundary::Finish),
            Transition::Cancel(_) => Some(Boundary::Cancel),
        }
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Transition::None => None,
            Transition::Start(txn) | Transition::Finish(txn) | Transition::Cancel(txn) => Some(*txn),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Finish(_) | Transition::Cancel(_))
    }
}

/// Nesting state of one Context
///
/// Invariant: `transaction` is `Some` exactly when `depth > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroupStack {
    context_key: StateToken,
    depth: usize,
    cancelled: bool,
    transaction: Option<TransactionId>,
    // terminal boundary the manager rejected, kept for retry or escalation
    unresolved: Option<Transition>,
}

impl ActionGroupStack {
    pub fn new(context_key: StateToken) -> Self {
        Self {
            context_key,
            depth: 0,
            cancelled: false,
            transaction: None,
            unresolved: None,
        }
    }

    pub fn context_key(&self) -> &StateToken {
        &self.context_key
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the open transaction has been poisoned by a cancel
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn unresolved(&self) -> Option<Transition> {
        self.unresolved
    }

    /// Nothing open and nothing owed to the manager
    pub fn is_idle(&self) -> bool {
        self.depth == 0 && self.unresolved.is_none()
    }

    /// Open a scope. `mint` is only called on the 0 -> 1 transition.
    pub fn enter(&mut self, mint: impl FnOnce() -> TransactionId) -> Transition {
        self.depth += 1;
        if self.depth > 1 {
            return Transition::None;
        }

        if let Some(abandoned) = self.unresolved.take() {
            warn!(
                "Abandoning unresolved {:?} for state {} to start a new transaction",
                abandoned, self.context_key
            );
        }
        let txn = mint();
        self.transaction = Some(txn);
        self.cancelled = false;
        Transition::Start(txn)
    }

    /// Poison the open transaction without leaving the current scope.
    /// Returns false when there is no open transaction to poison.
    pub fn poison(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.cancelled = true;
        true
    }

    /// Close a scope. The terminal call is decided only when depth reaches 0.
    pub fn exit(&mut self, cancel: bool) -> Result<Transition> {
        let txn = match (self.depth, self.transaction) {
            (0, _) | (_, None) => return Err(BridgeError::unbalanced(self.context_key.as_str())),
            (_, Some(txn)) => txn,
        };

        if cancel {
            self.cancelled = true;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(Transition::None);
        }

        self.transaction = None;
        if std::mem::take(&mut self.cancelled) {
            Ok(Transition::Cancel(txn))
        } else {
            Ok(Transition::Finish(txn))
        }
    }

    /// Force the stack back to depth 0. Returns the cancel owed to the
    /// manager, if any: for the open transaction, or for an unresolved
    /// terminal that is being escalated.
    pub fn cancel_all(&mut self) -> Transition {
        let owed = match (self.transaction.take(), self.unresolved.take()) {
            (Some(txn), _) => Some(txn),
            (None, Some(pending)) => pending.transaction(),
            (None, None) => None,
        };
        self.depth = 0;
        self.cancelled = false;
        owed.map(Transition::Cancel).unwrap_or(Transition::None)
    }

    /// Remember a terminal boundary the manager rejected. Ignored if a new
    /// transaction has already been opened on this stack.
    pub fn record_unresolved(&mut self, failed: Transition) -> bool {
        if !failed.is_terminal() || self.depth > 0 {
            return false;
        }
        self.unresolved = Some(failed);
        true
    }

    pub fn take_unresolved(&mut self) -> Option<Transition> {
        self.unresolved.take()
    }
}
