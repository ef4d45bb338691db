//! Action group coordination against the in-memory manager
//!
//! Every test reads the manager's call log to check what crossed the
//! boundary, since that is the only thing the manager ever observes.

use liaison::manager::ManagerCall;
use liaison::{
    AccessIntent, Boundary, BridgeError, Context, HostSession, InMemoryManager, Locale,
    ManagerError, ManagerStateStore, Retention, ScopeExit, StateToken, TransactionCoordinator,
};
use pretty_assertions::assert_eq;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use std::thread;

fn setup() -> (Arc<InMemoryManager>, TransactionCoordinator, Context) {
    let manager = Arc::new(InMemoryManager::new());
    let coordinator = TransactionCoordinator::new(manager.clone());
    let ctx = coordinator.create_context().unwrap();
    (manager, coordinator, ctx)
}

fn start_then(ctx: &Context, terminal: fn(StateToken) -> ManagerCall) -> Vec<ManagerCall> {
    let token = ctx.state_token().clone();
    vec![ManagerCall::Start(token.clone()), terminal(token)]
}

#[test]
fn test_nested_enter_exit_finishes_once() {
    let (manager, coordinator, ctx) = setup();

    let outer = coordinator.scoped_enter(&ctx).unwrap();
    let inner = coordinator.scoped_enter(&ctx).unwrap();
    assert_eq!(coordinator.depth(&ctx), 2);
    assert_eq!(manager.calls_for(ctx.state_token()), vec![ManagerCall::Start(ctx.state_token().clone())]);

    assert_eq!(inner.release().unwrap(), ScopeExit::Nested);
    assert_eq!(outer.release().unwrap(), ScopeExit::Finished);

    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Finish));
    assert_eq!(coordinator.depth(&ctx), 0);
}

#[test]
fn test_inner_cancel_cancels_transaction() {
    let (manager, coordinator, ctx) = setup();

    let outer = coordinator.scoped_enter(&ctx).unwrap();
    let inner = coordinator.scoped_enter(&ctx).unwrap();
    assert_eq!(inner.abort().unwrap(), ScopeExit::Nested);
    assert_eq!(outer.release().unwrap(), ScopeExit::Cancelled);

    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));
    let record = manager.record(ctx.state_token()).unwrap();
    assert_eq!((record.finished, record.cancelled), (0, 1));
}

#[test]
fn test_cancel_all_at_depth_three() {
    let (manager, coordinator, ctx) = setup();

    let first = coordinator.scoped_enter(&ctx).unwrap();
    let second = coordinator.scoped_enter(&ctx).unwrap();
    let third = coordinator.scoped_enter(&ctx).unwrap();
    assert_eq!(coordinator.depth(&ctx), 3);

    assert!(coordinator.cancel_all(&ctx).unwrap());
    assert_eq!(coordinator.depth(&ctx), 0);
    assert!(coordinator.stack(&ctx).is_none());

    // the old handles can no longer finish anything
    assert_eq!(third.release().unwrap(), ScopeExit::Detached);
    assert_eq!(second.release().unwrap(), ScopeExit::Detached);
    assert_eq!(first.release().unwrap(), ScopeExit::Detached);
    assert!(!coordinator.cancel_all(&ctx).unwrap());
    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));

    // a new enter opens a new transaction
    let next = coordinator.scoped_enter(&ctx).unwrap();
    assert_eq!(next.release().unwrap(), ScopeExit::Finished);
    assert_eq!(manager.record(ctx.state_token()).unwrap().started, 2);
}

#[test]
fn test_nesting_shapes_make_one_start_and_one_terminal() {
    let (manager, coordinator, ctx) = setup();

    // siblings at depth 2 and 3 under a single outer scope
    let outer = coordinator.scoped_enter(&ctx).unwrap();
    for _ in 0..3 {
        let child = coordinator.scoped_enter(&ctx).unwrap();
        let grandchild = coordinator.scoped_enter(&ctx).unwrap();
        assert_eq!(grandchild.release().unwrap(), ScopeExit::Nested);
        assert_eq!(child.release().unwrap(), ScopeExit::Nested);
    }
    assert_eq!(outer.release().unwrap(), ScopeExit::Finished);

    // deep chain with a cancel at the innermost level
    let handles: Vec<_> = (0..6).map(|_| coordinator.scoped_enter(&ctx).unwrap()).collect();
    assert_eq!(coordinator.depth(&ctx), 6);
    let mut exits = Vec::new();
    for (i, handle) in handles.into_iter().rev().enumerate() {
        exits.push(if i == 0 { handle.abort() } else { handle.release() }.unwrap());
    }
    assert_eq!(exits.last(), Some(&ScopeExit::Cancelled));

    let token = ctx.state_token().clone();
    assert_eq!(
        manager.calls_for(&token),
        vec![
            ManagerCall::Start(token.clone()),
            ManagerCall::Finish(token.clone()),
            ManagerCall::Start(token.clone()),
            ManagerCall::Cancel(token.clone()),
        ]
    );
}

#[test]
fn test_cancel_without_exit_poisons_transaction() {
    let (manager, coordinator, ctx) = setup();

    let outer = coordinator.scoped_enter(&ctx).unwrap();
    let inner = coordinator.scoped_enter(&ctx).unwrap();
    assert!(inner.cancel());
    assert_eq!(inner.depth(), 2);
    assert!(coordinator.stack(&ctx).unwrap().is_cancelled());

    inner.release().unwrap();
    assert_eq!(outer.release().unwrap(), ScopeExit::Cancelled);
    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));
}

#[test]
fn test_dropped_handle_cancels() {
    let (manager, coordinator, ctx) = setup();

    fn work(coordinator: &TransactionCoordinator, ctx: &Context) -> Result<(), BridgeError> {
        let _scope = coordinator.scoped_enter(ctx)?;
        Err(BridgeError::codec("bad input"))
    }

    assert!(work(&coordinator, &ctx).is_err());
    assert_eq!(coordinator.depth(&ctx), 0);
    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));
}

#[test]
fn test_panic_unwind_cancels() {
    let (manager, coordinator, ctx) = setup();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _outer = coordinator.scoped_enter(&ctx).unwrap();
        let _inner = coordinator.scoped_enter(&ctx).unwrap();
        panic!("host crashed mid-shot");
    }));

    assert!(result.is_err());
    assert_eq!(coordinator.depth(&ctx), 0);
    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));
    assert!(!manager.is_open(ctx.state_token()));
}

#[test]
fn test_scoped_closure() {
    let (manager, coordinator, ctx) = setup();

    let value: Result<u32, BridgeError> = coordinator.scoped(&ctx, |scope| {
        assert_eq!(scope.depth(), 1);
        coordinator.scoped(&ctx, |inner| -> Result<(), BridgeError> {
            assert_eq!(inner.depth(), 2);
            Ok(())
        })?;
        Ok(42)
    });
    assert_eq!(value.unwrap(), 42);

    let failed: Result<(), BridgeError> =
        coordinator.scoped(&ctx, |_| Err(BridgeError::configuration("publish failed")));
    assert_eq!(failed.unwrap_err().category(), "configuration");

    let token = ctx.state_token().clone();
    assert_eq!(
        manager.calls_for(&token),
        vec![
            ManagerCall::Start(token.clone()),
            ManagerCall::Finish(token.clone()),
            ManagerCall::Start(token.clone()),
            ManagerCall::Cancel(token.clone()),
        ]
    );
}

#[test]
fn test_scoped_closure_fails_when_finish_is_rejected() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Finish, 1);

    let result: Result<&str, BridgeError> = coordinator.scoped(&ctx, |_| Ok("published"));
    let err = result.unwrap_err();
    assert_eq!(err.rejected_boundary(), Some(Boundary::Finish));

    // the finish is still owed
    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), Some(Boundary::Finish));
    assert_eq!(manager.record(ctx.state_token()).unwrap().finished, 1);
}

#[test]
fn test_start_failure_leaves_depth_zero() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Start, 1);

    let err = coordinator.scoped_enter(&ctx).unwrap_err();
    assert_eq!(err.rejected_boundary(), Some(Boundary::Start));
    assert!(err.is_recoverable());
    assert_eq!(coordinator.depth(&ctx), 0);
    assert!(coordinator.stack(&ctx).is_none());

    // retry is just another enter
    let scope = coordinator.scoped_enter(&ctx).unwrap();
    assert_eq!(scope.release().unwrap(), ScopeExit::Finished);

    let token = ctx.state_token().clone();
    assert_eq!(
        manager.calls_for(&token),
        vec![
            ManagerCall::Start(token.clone()),
            ManagerCall::Start(token.clone()),
            ManagerCall::Finish(token.clone()),
        ]
    );
    assert_eq!(coordinator.stats().boundary_failures, 1);
}

#[test]
fn test_finish_failure_can_be_retried() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Finish, 1);

    let scope = coordinator.scoped_enter(&ctx).unwrap();
    let err = scope.release().unwrap_err();
    assert!(matches!(
        err,
        BridgeError::TransactionBoundary { boundary: Boundary::Finish, .. }
    ));
    assert_eq!(coordinator.depth(&ctx), 0);
    assert!(manager.is_open(ctx.state_token()));
    assert_eq!(coordinator.stats().active_stacks, 1);

    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), Some(Boundary::Finish));
    assert!(!manager.is_open(ctx.state_token()));
    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), None);
    assert_eq!(coordinator.stats().active_stacks, 0);
}

#[test]
fn test_finish_failure_escalates_to_cancel() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Finish, 1);

    let scope = coordinator.scoped_enter(&ctx).unwrap();
    assert!(scope.release().is_err());
    assert!(coordinator.cancel_all(&ctx).unwrap());

    let token = ctx.state_token().clone();
    assert_eq!(
        manager.calls_for(&token),
        vec![
            ManagerCall::Start(token.clone()),
            ManagerCall::Finish(token.clone()),
            ManagerCall::Cancel(token.clone()),
        ]
    );
    assert_eq!(manager.record(&token).unwrap().cancelled, 1);
    assert!(coordinator.stack(&ctx).is_none());
}

#[test]
fn test_failed_retry_stays_unresolved() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Cancel, 2);

    let scope = coordinator.scoped_enter(&ctx).unwrap();
    assert!(scope.abort().is_err());
    assert!(coordinator.retry_boundary(&ctx).is_err());

    let stack = coordinator.stack(&ctx).unwrap();
    assert_eq!(stack.unresolved().and_then(|t| t.boundary()), Some(Boundary::Cancel));
    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), Some(Boundary::Cancel));
    assert!(!manager.is_open(ctx.state_token()));
}

#[test]
fn test_dropped_handle_with_failing_cancel_is_recorded() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::Cancel, 1);

    drop(coordinator.scoped_enter(&ctx).unwrap());

    assert_eq!(coordinator.depth(&ctx), 0);
    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), Some(Boundary::Cancel));
    assert_eq!(manager.record(ctx.state_token()).unwrap().cancelled, 1);
}

#[test]
fn test_child_contexts_are_independent() {
    let (manager, coordinator, parent) = setup();
    let parent = parent
        .with_access(AccessIntent::Write)
        .with_retention(Retention::PersistentHint)
        .with_locale(Locale::new("locale:publish").with_field("tool", "nuke"));

    let child = coordinator.create_child_context(&parent).unwrap();
    assert_ne!(child.state_token(), parent.state_token());
    assert_eq!(child.access(), AccessIntent::Write);
    assert_eq!(child.retention(), Retention::PersistentHint);
    assert_eq!(child.locale(), parent.locale());
    assert_eq!(
        manager.record(child.state_token()).unwrap().parent.as_ref(),
        Some(parent.state_token())
    );

    let parent_scope = coordinator.scoped_enter(&parent).unwrap();
    let child_scope = coordinator.scoped_enter(&child).unwrap();
    assert_eq!(coordinator.depth(&parent), 1);
    assert_eq!(coordinator.depth(&child), 1);
    assert_eq!(coordinator.stats().active_stacks, 2);

    assert_eq!(child_scope.abort().unwrap(), ScopeExit::Cancelled);
    assert_eq!(parent_scope.release().unwrap(), ScopeExit::Finished);
}

#[test]
fn test_create_state_failure() {
    let (manager, coordinator, ctx) = setup();
    manager.fail_next(Boundary::CreateState, 1);

    let err = coordinator.create_child_context(&ctx).unwrap_err();
    assert_eq!(err.rejected_boundary(), Some(Boundary::CreateState));
    assert!(coordinator.create_child_context(&ctx).is_ok());
}

#[test]
fn test_distinct_contexts_in_parallel() {
    let (manager, coordinator, _) = setup();
    let contexts: Vec<Context> = (0..8).map(|_| coordinator.create_context().unwrap()).collect();

    thread::scope(|s| {
        for ctx in &contexts {
            let coordinator = &coordinator;
            s.spawn(move || {
                for round in 0..20 {
                    let outer = coordinator.scoped_enter(ctx).unwrap();
                    let inner = coordinator.scoped_enter(ctx).unwrap();
                    if round % 2 == 0 {
                        inner.release().unwrap();
                    } else {
                        inner.abort().unwrap();
                    }
                    outer.release().unwrap();
                }
            });
        }
    });

    for ctx in &contexts {
        let record = manager.record(ctx.state_token()).unwrap();
        assert_eq!((record.started, record.finished, record.cancelled), (20, 10, 10));
        assert!(!record.open);
    }
    let stats = coordinator.stats();
    assert_eq!(stats.active_stacks, 0);
    assert_eq!(stats.transactions_started, 160);
    assert_eq!(stats.transactions_finished + stats.transactions_cancelled, 160);
}

#[test]
fn test_concurrent_first_use_of_one_context() {
    let (manager, coordinator, ctx) = setup();
    let workers = 8;
    let entered = Barrier::new(workers);

    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                let scope = coordinator.scoped_enter(&ctx).unwrap();
                entered.wait();
                scope.release().unwrap();
            });
        }
    });

    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Finish));
    assert_eq!(coordinator.depth(&ctx), 0);
}

#[test]
fn test_cancel_all_from_another_thread() {
    let (manager, coordinator, ctx) = setup();
    let entered = Barrier::new(2);
    let cancelled = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let outer = coordinator.scoped_enter(&ctx).unwrap();
            let inner = coordinator.scoped_enter(&ctx).unwrap();
            entered.wait();
            cancelled.wait();
            assert_eq!(inner.release().unwrap(), ScopeExit::Detached);
            assert_eq!(outer.release().unwrap(), ScopeExit::Detached);
        });
        s.spawn(|| {
            entered.wait();
            assert!(coordinator.cancel_all(&ctx).unwrap());
            cancelled.wait();
        });
    });

    assert_eq!(coordinator.depth(&ctx), 0);
    assert_eq!(manager.calls_for(ctx.state_token()), start_then(&ctx, ManagerCall::Cancel));
}

/// Holds every start until the test lets it through
struct GatedStartManager {
    inner: InMemoryManager,
    // accept a cancel with nothing open, as some managers do
    lenient_cancel: bool,
    arrived: Barrier,
    resume: Barrier,
}

impl GatedStartManager {
    fn new(lenient_cancel: bool) -> Self {
        Self {
            inner: InMemoryManager::new(),
            lenient_cancel,
            arrived: Barrier::new(2),
            resume: Barrier::new(2),
        }
    }
}

impl ManagerStateStore for GatedStartManager {
    fn create_state(
        &self,
        session: &HostSession,
        parent: Option<&StateToken>,
    ) -> Result<StateToken, ManagerError> {
        self.inner.create_state(session, parent)
    }

    fn start_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        self.arrived.wait();
        self.resume.wait();
        self.inner.start_transaction(session, state)
    }

    fn finish_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        self.inner.finish_transaction(session, state)
    }

    fn cancel_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError> {
        if self.lenient_cancel && !self.inner.is_open(state) {
            return Ok(());
        }
        self.inner.cancel_transaction(session, state)
    }
}

/// cancel_all lands while the outermost enter's start is still with the manager
fn cancel_all_during_start(
    lenient_cancel: bool,
) -> (Arc<GatedStartManager>, TransactionCoordinator, Context, liaison::Result<bool>, ScopeExit) {
    let manager = Arc::new(GatedStartManager::new(lenient_cancel));
    let coordinator = TransactionCoordinator::new(manager.clone());
    let ctx = coordinator.create_context().unwrap();

    let (cancelled, exit) = thread::scope(|s| {
        let enter = s.spawn(|| coordinator.scoped_enter(&ctx).unwrap().release().unwrap());
        manager.arrived.wait();
        let cancelled = coordinator.cancel_all(&ctx);
        manager.resume.wait();
        (cancelled, enter.join().unwrap())
    });
    (manager, coordinator, ctx, cancelled, exit)
}

#[test]
fn test_cancel_all_during_start_cancels_late_start() {
    let (manager, coordinator, ctx, cancelled, exit) = cancel_all_during_start(false);
    let token = ctx.state_token().clone();

    // the first cancel reached the manager before the start
    assert_eq!(cancelled.unwrap_err().rejected_boundary(), Some(Boundary::Cancel));
    assert_eq!(exit, ScopeExit::Detached);

    assert!(!manager.inner.is_open(&token));
    assert_eq!(
        manager.inner.calls_for(&token),
        vec![
            ManagerCall::Cancel(token.clone()),
            ManagerCall::Start(token.clone()),
            ManagerCall::Cancel(token.clone()),
        ]
    );
    let record = manager.inner.record(&token).unwrap();
    assert_eq!((record.started, record.finished, record.cancelled), (1, 0, 1));

    // the late cancel settled what cancel_all owed
    assert!(coordinator.stack(&ctx).is_none());
    assert_eq!(coordinator.retry_boundary(&ctx).unwrap(), None);
    assert_eq!(coordinator.depth(&ctx), 0);
}

#[test]
fn test_cancel_all_during_start_with_lenient_manager() {
    let (manager, coordinator, ctx, cancelled, exit) = cancel_all_during_start(true);
    let token = ctx.state_token().clone();

    assert!(cancelled.unwrap());
    assert_eq!(exit, ScopeExit::Detached);
    assert!(!manager.inner.is_open(&token));
    assert_eq!(
        manager.inner.calls_for(&token),
        vec![ManagerCall::Start(token.clone()), ManagerCall::Cancel(token.clone())]
    );
    assert!(coordinator.stack(&ctx).is_none());
}

#[test]
fn test_rejected_start_unwinds_joined_scope() {
    let manager = Arc::new(GatedStartManager::new(false));
    manager.inner.fail_next(Boundary::Start, 1);
    let coordinator = TransactionCoordinator::new(manager.clone());
    let ctx = coordinator.create_context().unwrap();
    let token = ctx.state_token().clone();

    thread::scope(|s| {
        let starter = s.spawn(|| coordinator.scoped_enter(&ctx).map(|scope| scope.transaction()));
        manager.arrived.wait();

        // joins the transaction whose start is still with the manager
        let joined = coordinator.scoped_enter(&ctx).unwrap();
        assert_eq!(coordinator.depth(&ctx), 2);
        manager.resume.wait();

        let err = starter.join().unwrap().unwrap_err();
        assert_eq!(err.rejected_boundary(), Some(Boundary::Start));
        assert_eq!(joined.depth(), 1);
        assert!(coordinator.stack(&ctx).unwrap().is_cancelled());

        // the manager never opened it, so the owed cancel is rejected too
        let err = joined.release().unwrap_err();
        assert_eq!(err.rejected_boundary(), Some(Boundary::Cancel));
    });

    assert_eq!(coordinator.depth(&ctx), 0);
    assert!(!manager.inner.is_open(&token));
    assert_eq!(
        manager.inner.calls_for(&token),
        vec![ManagerCall::Start(token.clone()), ManagerCall::Cancel(token.clone())]
    );
}
