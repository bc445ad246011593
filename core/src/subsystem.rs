//! Cycle trait and cancellation.
//!
//! RULE: Every scheduled engine job implements EngineCycle.
//! The Orchestrator runs each cycle on its own interval and turns the
//! returned events into audit records. Cycles never call each other.

use crate::{error::EngineResult, event::EngineEvent, types::Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The contract every scheduled cycle must fulfil.
pub trait EngineCycle: Send + Sync {
    /// Unique stable name for this cycle.
    fn name(&self) -> &'static str;

    /// Run one pass.
    ///
    /// - `now`:    clock reading taken by the scheduler for this pass
    /// - `cancel`: checked at safe points; a cancelled pass publishes nothing
    ///
    /// Returns the events to audit.
    fn run(&self, now: Timestamp, cancel: &CancelToken) -> EngineResult<Vec<EngineEvent>>;
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
