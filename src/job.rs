//! Job context and cancellation.
//!
//! The collector runs as a single long-lived job under an external
//! scheduler. The scheduler owns a [`StopHandle`]; the job polls its
//! [`JobContext`] at startup and between blob iterations, so an operator
//! stop takes effect at the next item boundary and never leaves a blob in
//! a state worse than `DeleteFailed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operator-facing side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request a graceful stop. The running job finishes its current item
    /// and exits without flushing the trash, so the next run picks up the
    /// remaining candidates.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Job-facing side of the stop signal.
#[derive(Debug, Clone)]
pub struct JobContext {
    flag: Arc<AtomicBool>,
}

impl JobContext {
    /// A context plus the handle that can stop it.
    pub fn new() -> (Self, StopHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                flag: Arc::clone(&flag),
            },
            StopHandle { flag },
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_visible_through_the_context() {
        let (ctx, handle) = JobContext::new();
        assert!(!ctx.is_stopped());
        handle.stop();
        assert!(ctx.is_stopped());
    }
}
