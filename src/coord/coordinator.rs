//! TransactionCoordinator - multiplexes action group stacks per Context
//!
//! One stack per state token in flight, created on first enter and dropped
//! once it is back at depth 0 with nothing owed to the manager. Stack state
//! is only touched under the map's shard lock; manager calls are made after
//! that lock is released, so a slow manager never blocks other Contexts.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::{Context, StateToken};
use crate::coord::codec::{PortableToken, StateTokenCodec};
use crate::coord::scope::{ScopeExit, ScopeHandle};
use crate::coord::stack::{ActionGroupStack, TransactionId, Transition};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{BridgeError, Result};
use crate::manager::{Boundary, HostSession, ManagerStateStore};

/// Snapshot of coordinator activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Contexts with an open transaction or an unresolved terminal
    pub active_stacks: usize,
    pub transactions_started: u64,
    pub transactions_finished: u64,
    pub transactions_cancelled: u64,
    /// Manager calls that failed, state creation included
    pub boundary_failures: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    finished: AtomicU64,
    cancelled: AtomicU64,
    boundary_failures: AtomicU64,
}

/// Facade hosts use to group work into manager transactions
pub struct TransactionCoordinator {
    manager: Arc<dyn ManagerStateStore>,
    session: HostSession,
    codec: StateTokenCodec,
    stacks: DashMap<StateToken, ActionGroupStack>,
    next_transaction: AtomicU64,
    counters: Counters,
}

impl TransactionCoordinator {
    /// Create a coordinator with the default configuration
    pub fn new(manager: Arc<dyn ManagerStateStore>) -> Self {
        Self::build(manager, &CoordinatorConfig::default())
    }

    /// Create a coordinator from a validated configuration
    pub fn with_config(manager: Arc<dyn ManagerStateStore>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(manager, &config))
    }

    fn build(manager: Arc<dyn ManagerStateStore>, config: &CoordinatorConfig) -> Self {
        let session = HostSession::new(config.host_identifier.clone());
        info!(
            "Transaction coordinator ready for host {} (session {})",
            session.host_identifier(),
            session.session_id()
        );
        Self {
            manager,
            session,
            codec: StateTokenCodec::from_config(config),
            stacks: DashMap::new(),
            next_transaction: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn session(&self) -> &HostSession {
        &self.session
    }

    pub fn codec(&self) -> &StateTokenCodec {
        &self.codec
    }

    /// Obtain a Context carrying a freshly minted state token
    pub fn create_context(&self) -> Result<Context> {
        let token = self
            .manager
            .create_state(&self.session, None)
            .map_err(|e| self.boundary_failed(Boundary::CreateState, "(new)", e))?;
        debug!("Created context for state {}", token);
        Ok(Context::new(token))
    }

    /// Obtain a Context whose state the manager derives from `parent`'s.
    /// The child gets its own token and therefore its own action groups.
    pub fn create_child_context(&self, parent: &Context) -> Result<Context> {
        let token = self
            .manager
            .create_state(&self.session, Some(parent.state_token()))
            .map_err(|e| self.boundary_failed(Boundary::CreateState, parent.state_token().as_str(), e))?;
        debug!("Created child state {} of {}", token, parent.state_token());
        Ok(Context::new(token)
            .with_access(parent.access())
            .with_retention(parent.retention())
            .with_locale(parent.locale().clone()))
    }

    /// Enter an action group. The transaction starts on the outermost enter.
    ///
    /// If the manager rejects the start, the enter is undone locally and the
    /// Context is left at depth 0; calling this again retries the start.
    ///
    /// If `cancel_all` runs while the start is in flight, the started
    /// transaction is cancelled as soon as the manager accepts it and the
    /// returned handle is already detached.
    pub fn scoped_enter(&self, context: &Context) -> Result<ScopeHandle<'_>> {
        let key = context.state_token();
        let (transition, txn, depth) = {
            let mut stack = self
                .stacks
                .entry(key.clone())
                .or_insert_with(|| ActionGroupStack::new(key.clone()));
            let transition = stack.enter(|| self.mint_transaction());
            (transition, stack.transaction(), stack.depth())
        };
        let txn = txn.ok_or_else(|| BridgeError::unbalanced(key.as_str()))?;
        debug!("Entered action group for state {} at depth {}", key, depth);

        if let Err(err) = self.apply(key, transition) {
            if let Entry::Occupied(mut entry) = self.stacks.entry(key.clone()) {
                if entry.get().transaction() == Some(txn) {
                    if entry.get().depth() == 1 {
                        entry.remove();
                    } else {
                        // scopes that joined before the start was rejected
                        // unwind into a cancel
                        if let Err(e) = entry.get_mut().exit(true) {
                            warn!("Failed to unwind rejected start for state {}: {}", key, e);
                        }
                    }
                }
            }
            return Err(err);
        }
        if matches!(transition, Transition::Start(_)) {
            self.settle_orphaned_start(key, txn)?;
        }
        Ok(ScopeHandle::new(self, key.clone(), txn))
    }

    /// Run `f` inside an action group: released on `Ok`, aborted on `Err`
    ///
    /// A closure that returned `Ok` still yields `Err` when the manager
    /// rejects the finish; its value is dropped and the finish stays owed
    /// (see `retry_boundary`).
    pub fn scoped<T, E, F>(&self, context: &Context, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&ScopeHandle<'_>) -> std::result::Result<T, E>,
        E: From<BridgeError>,
    {
        let scope = self.scoped_enter(context)?;
        match f(&scope) {
            Ok(value) => {
                scope.release()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = scope.abort() {
                    warn!(
                        "Failed to cancel action group for state {} after error: {}",
                        context.state_token(),
                        abort_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Force the Context back to depth 0, cancelling whatever is open or
    /// still owed to the manager. Returns whether a cancel was issued.
    ///
    /// Outstanding scope handles for the cancelled transaction become
    /// detached: releasing them makes no manager call.
    pub fn cancel_all(&self, context: &Context) -> Result<bool> {
        let key = context.state_token();
        let transition = match self.stacks.entry(key.clone()) {
            Entry::Vacant(_) => Transition::None,
            Entry::Occupied(mut entry) => {
                let transition = entry.get_mut().cancel_all();
                entry.remove();
                transition
            }
        };

        if transition == Transition::None {
            debug!("Nothing to cancel for state {}", key);
            return Ok(false);
        }
        info!("Cancelling all action groups for state {}", key);
        if let Err(err) = self.apply(key, transition) {
            self.record_unresolved(key, transition);
            return Err(err);
        }
        Ok(true)
    }

    /// Re-issue a finish or cancel the manager previously rejected.
    /// Returns the boundary retried, or None if nothing was owed.
    pub fn retry_boundary(&self, context: &Context) -> Result<Option<Boundary>> {
        let key = context.state_token();
        let pending = match self.stacks.entry(key.clone()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut().take_unresolved();
                if entry.get().is_idle() {
                    entry.remove();
                }
                pending
            }
        };

        match pending {
            None => Ok(None),
            Some(pending) => {
                info!("Retrying {:?} for state {}", pending, key);
                if let Err(err) = self.apply(key, pending) {
                    self.record_unresolved(key, pending);
                    return Err(err);
                }
                Ok(pending.boundary())
            }
        }
    }

    /// Export the Context's correlation state for another process
    pub fn freeze(&self, context: &Context) -> Result<PortableToken> {
        self.codec.freeze(context)
    }

    /// Rebuild a Context exported by `freeze`, here or in another process
    pub fn thaw(&self, token: &PortableToken) -> Result<Context> {
        self.codec.thaw(token)
    }

    /// Current nesting depth for the Context (0 when nothing is open)
    pub fn depth(&self, context: &Context) -> usize {
        self.depth_of(context.state_token())
    }

    /// Copy of the Context's stack, if one is live
    pub fn stack(&self, context: &Context) -> Option<ActionGroupStack> {
        self.stacks.get(context.state_token()).map(|s| s.value().clone())
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            active_stacks: self.stacks.len(),
            transactions_started: self.counters.started.load(Ordering::Relaxed),
            transactions_finished: self.counters.finished.load(Ordering::Relaxed),
            transactions_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            boundary_failures: self.counters.boundary_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn depth_of(&self, key: &StateToken) -> usize {
        self.stacks.get(key).map(|s| s.depth()).unwrap_or(0)
    }

    pub(crate) fn poison(&self, key: &StateToken, txn: TransactionId) -> bool {
        match self.stacks.get_mut(key) {
            Some(mut stack) if stack.transaction() == Some(txn) => stack.poison(),
            _ => false,
        }
    }

    /// Leave one scope of transaction `txn`. A handle whose transaction was
    /// already cancelled by `cancel_all` is detached and makes no call.
    pub(crate) fn exit_scope(&self, key: &StateToken, txn: TransactionId, cancel: bool) -> Result<ScopeExit> {
        let transition = match self.stacks.entry(key.clone()) {
            Entry::Vacant(_) => {
                debug!("Scope of {} for state {} is detached", txn, key);
                return Ok(ScopeExit::Detached);
            }
            Entry::Occupied(mut entry) => {
                if entry.get().transaction() != Some(txn) {
                    debug!("Scope of {} for state {} is detached", txn, key);
                    return Ok(ScopeExit::Detached);
                }
                let transition = entry.get_mut().exit(cancel)?;
                debug!(
                    "Exited action group for state {} to depth {}",
                    key,
                    entry.get().depth()
                );
                if entry.get().is_idle() {
                    entry.remove();
                }
                transition
            }
        };

        let exit = match transition {
            Transition::None => return Ok(ScopeExit::Nested),
            Transition::Cancel(_) => ScopeExit::Cancelled,
            _ => ScopeExit::Finished,
        };
        if let Err(err) = self.apply(key, transition) {
            self.record_unresolved(key, transition);
            return Err(err);
        }
        Ok(exit)
    }

    /// Cancel a start the manager accepted after `cancel_all` already reset
    /// the stack. A cancel for `txn` that `cancel_all` could not deliver is
    /// superseded by this one.
    fn settle_orphaned_start(&self, key: &StateToken, txn: TransactionId) -> Result<()> {
        let orphaned = match self.stacks.entry(key.clone()) {
            Entry::Vacant(_) => true,
            Entry::Occupied(mut entry) => {
                if entry.get().transaction() == Some(txn) {
                    false
                } else {
                    if entry.get().unresolved().and_then(|t| t.transaction()) == Some(txn) {
                        entry.get_mut().take_unresolved();
                        if entry.get().is_idle() {
                            entry.remove();
                        }
                    }
                    true
                }
            }
        };
        if !orphaned {
            return Ok(());
        }

        warn!("Start of {} for state {} raced cancel_all, cancelling it", txn, key);
        let cancel = Transition::Cancel(txn);
        if let Err(err) = self.apply(key, cancel) {
            self.record_unresolved(key, cancel);
            return Err(err);
        }
        Ok(())
    }

    fn mint_transaction(&self) -> TransactionId {
        TransactionId::new(self.next_transaction.fetch_add(1, Ordering::Relaxed))
    }

    /// Forward a transition to the manager. Must not be called while holding
    /// a stack entry.
    fn apply(&self, key: &StateToken, transition: Transition) -> Result<()> {
        let (boundary, outcome) = match transition {
            Transition::None => return Ok(()),
            Transition::Start(_) => (Boundary::Start, self.manager.start_transaction(&self.session, key)),
            Transition::Finish(_) => (Boundary::Finish, self.manager.finish_transaction(&self.session, key)),
            Transition::Cancel(_) => (Boundary::Cancel, self.manager.cancel_transaction(&self.session, key)),
        };

        match outcome {
            Ok(()) => {
                let counter = match boundary {
                    Boundary::Start => &self.counters.started,
                    Boundary::Finish => &self.counters.finished,
                    _ => &self.counters.cancelled,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if let Some(txn) = transition.transaction() {
                    info!("Manager accepted {} of {} for state {}", boundary, txn, key);
                }
                Ok(())
            }
            Err(source) => Err(self.boundary_failed(boundary, key.as_str(), source)),
        }
    }

    fn boundary_failed(&self, boundary: Boundary, token: &str, source: crate::manager::ManagerError) -> BridgeError {
        self.counters.boundary_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Manager rejected {} for state {}: {}", boundary, token, source);
        BridgeError::boundary(boundary, token, source)
    }

    fn record_unresolved(&self, key: &StateToken, failed: Transition) {
        let mut stack = self
            .stacks
            .entry(key.clone())
            .or_insert_with(|| ActionGroupStack::new(key.clone()));
        if !stack.record_unresolved(failed) {
            warn!(
                "Dropping unresolved {:?} for state {}: a new transaction is already open",
                failed, key
            );
        }
    }
}
