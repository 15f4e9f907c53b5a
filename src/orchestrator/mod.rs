//! Call orchestration.
//!
//! - `retry`: error classification and backoff (RetryPolicy).
//! - `gate`: per-class concurrency ceilings (ConcurrencyGate) and per-scope
//!   ordering locks.
//! - `cancel`: cooperative cancellation with callbacks.
//! - `accounts`: continuation token and usage per session (SessionAccount).
//! - `resume`: resume-versus-fresh decisions (ContinuationResolver).
//! - `coordinator`: the end-to-end call flow over all of the above.

pub mod accounts;
pub mod cancel;
pub mod coordinator;
pub mod gate;
pub mod resume;
pub mod retry;

pub use accounts::{RolloverCheck, SessionAccounts};
pub use cancel::{CancelSignal, WaitOutcome};
pub use coordinator::{CallCoordinator, CallHooks, CallOutcome, CallRequest};
pub use gate::{ConcurrencyGate, GatePermit, ScopeGuard, ScopeLocks};
pub use resume::{CallRunner, ContextSource, ContinuationResolver, ResumeOutcome, ResumeStats};
pub use retry::{ErrorClass, RetryOptions, RetryOutcome, RetryPolicy};
