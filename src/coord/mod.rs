//! Transaction coordination for Contexts
//!
//! `stack` holds the pure nesting state machine, `coordinator` multiplexes
//! stacks per Context and drives the manager, `scope` is the RAII guard
//! handed to callers and `codec` moves Contexts between processes.

pub mod codec;
pub mod coordinator;
pub mod scope;
pub mod stack;

pub use codec::*;
pub use coordinator::*;
pub use scope::*;
pub use stack::*;
