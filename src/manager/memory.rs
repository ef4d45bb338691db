//! In-process manager that keeps transaction state per token
//!
//! Useful as a reference implementation and as a test double: every call is
//! recorded, and failures can be injected for any boundary.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::{Boundary, HostSession, ManagerError, ManagerStateStore};
use crate::context::StateToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryManagerError {
    #[error("Unknown state token: {0}")]
    UnknownState(String),
    #[error("Transaction already open for state: {0}")]
    TransactionAlreadyOpen(String),
    #[error("No open transaction for state: {0}")]
    NoOpenTransaction(String),
    #[error("Injected failure: {0}")]
    Injected(Boundary),
}

/// A call received by the manager, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    CreateState { parent: Option<StateToken> },
    Start(StateToken),
    Finish(StateToken),
    Cancel(StateToken),
}

impl ManagerCall {
    pub fn boundary(&self) -> Boundary {
        match self {
            ManagerCall::CreateState { .. } => Boundary::CreateState,
            ManagerCall::Start(_) => Boundary::Start,
            ManagerCall::Finish(_) => Boundary::Finish,
            ManagerCall::Cancel(_) => Boundary::Cancel,
        }
    }
}

/// Per-token bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateRecord {
    pub parent: Option<StateToken>,
    pub open: bool,
    pub started: u64,
    pub finished: u64,
    pub cancelled: u64,
}

#[derive(Default)]
pub struct InMemoryManager {
    states: DashMap<StateToken, StateRecord>,
    calls: Mutex<Vec<ManagerCall>>,
    failures: Mutex<HashMap<Boundary, usize>>,
}

impl InMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an externally minted token known, as if created by this manager
    pub fn adopt(&self, token: impl Into<StateToken>) {
        self.states.entry(token.into()).or_default();
    }

    /// Fail the next `count` calls for `boundary`
    pub fn fail_next(&self, boundary: Boundary, count: usize) {
        *self.failures.lock().entry(boundary).or_insert(0) += count;
    }

    /// All calls received so far, failed ones included
    pub fn calls(&self) -> Vec<ManagerCall> {
        self.calls.lock().clone()
    }

    /// Calls received for one token, excluding state creation
    pub fn calls_for(&self, token: &StateToken) -> Vec<ManagerCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| match call {
                ManagerCall::Start(t) | ManagerCall::Finish(t) | ManagerCall::Cancel(t) => t == token,
                ManagerCall::CreateState { .. } => false,
            })
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn knows(&self, token: &StateToken) -> bool {
        self.states.contains_key(token)
    }

    pub fn is_open(&self, token: &StateToken) -> bool {
        self.states.get(token).map(|r| r.open).unwrap_or(false)
    }

    pub fn record(&self, token: &StateToken) -> Option<StateRecord> {
        self.states.get(token).map(|r| r.value().clone())
    }

    fn log(&self, call: ManagerCall) {
        self.calls.lock().push(call);
    }

    fn injected(&self, boundary: Boundary) -> Result<(), MemoryManagerError> {
        let mut failures = self.failures.lock();
        match failures.get_mut(&boundary) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(MemoryManagerError::Injected(boundary))
            }
            _ => Ok(()),
        }
    }

    fn transition(
        &self,
        boundary: Boundary,
        state: &StateToken,
        apply: impl FnOnce(&mut StateRecord) -> Result<(), MemoryManagerError>,
    ) -> Result<(), ManagerError> {
        self.injected(boundary)?;
        let mut record = self
            .states
            .get_mut(state)
            .ok_or_else(|| MemoryManagerError::UnknownState(state.to_string()))?;
        apply(&mut *record)?;
        Ok(())
    }
}

impl ManagerStateStore for InMemoryManager {
    fn create_state(
        &self,
        session: &HostSession,
        parent: Option<&StateToken>,
    ) -> Result<StateToken, ManagerError> {
        self.log(ManagerCall::CreateState {
            parent: parent.cloned(),
        });
        self.injected(Boundary::CreateState)?;

        if let Some(parent) = parent {
            if !self.states.contains_key(parent) {
                return Err(MemoryManagerError::UnknownState(parent.to_string()).into());
            }
        }

        let token = StateToken::new(format!("state-{}", Uuid::new_v4()));
        self.states.insert(
            token.clone(),
            StateRecord {
                parent: parent.cloned(),
                ..Default::default()
            },
        );
        debug!("Created state {} for host {}", token, session.host_identifier());
        Ok(token)
    }

    fn start_transaction(&self, _session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        self.log(ManagerCall::Start(state.clone()));
        self.transition(Boundary::Start, state, |record| {
            if record.open {
                return Err(MemoryManagerError::TransactionAlreadyOpen(state.to_string()));
            }
            record.open = true;
            record.started += 1;
            Ok(())
        })
    }

    fn finish_transaction(&self, _session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        self.log(ManagerCall::Finish(state.clone()));
        self.transition(Boundary::Finish, state, |record| {
            if !record.open {
                return Err(MemoryManagerError::NoOpenTransaction(state.to_string()));
            }
            record.open = false;
            record.finished += 1;
            Ok(())
        })
    }

    fn cancel_transaction(&self, _session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        self.log(ManagerCall::Cancel(state.clone()));
        self.transition(Boundary::Cancel, state, |record| {
            if !record.open {
                return Err(MemoryManagerError::NoOpenTransaction(state.to_string()));
            }
            record.open = false;
            record.cancelled += 1;
            Ok(())
        })
    }
}
