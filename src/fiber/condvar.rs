//! Fiber suspension primitive (§4.6): `wait(fiber, predicate)` suspends
//! until notified AND the predicate holds; spurious wakeups are permitted,
//! so callers always re-check the predicate in a loop.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::FiberHandle;

/// A condition variable over fibers rather than OS threads. Only ever
/// touched from the owning Event Processor thread (§5).
pub struct ConditionVariable {
    waiters: Mutex<VecDeque<FiberHandle>>,
}

impl ConditionVariable {
    pub fn new() -> ConditionVariable {
        ConditionVariable {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspends `fiber` until `predicate` holds, re-checking after every
    /// notification (spurious wakeups permitted).
    pub fn wait(&self, fiber: &FiberHandle, predicate: impl Fn() -> bool) {
        while !predicate() {
            self.waiters.lock().unwrap().push_back(fiber.clone());
            crate::fiber::Fiber::wait(&fiber.0);
        }
    }

    pub fn notify_one(&self) {
        if let Some(waiter) = self.waiters.lock().unwrap().pop_front() {
            waiter.resume();
        }
    }

    pub fn notify_all(&self) {
        let waiters: Vec<_> = self.waiters.lock().unwrap().drain(..).collect();
        for waiter in waiters {
            waiter.resume();
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> ConditionVariable {
        ConditionVariable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fiber::Fiber;
    use crate::reactor::EventProcessor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn notify_all_drains_waiters() {
        let cv = Arc::new(ConditionVariable::new());
        assert_eq!(cv.waiters.lock().unwrap().len(), 0);
        cv.notify_all();
    }

    #[test]
    fn wait_returns_immediately_when_predicate_already_true() {
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let cv = ConditionVariable::new();
        let ready = Arc::new(AtomicBool::new(true));
        let handle = Fiber::execute(&processor, || {});
        cv.wait(&handle, || ready.load(Ordering::SeqCst));
    }
}
