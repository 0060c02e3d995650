//! Fiber + FiberCache (C6): a stackful cooperative coroutine bound to one
//! Event Processor, built on `corosensei` per design note (a) — a real
//! assembly context-switch on a heap-allocated stack, rather than
//! hand-rolled `ucontext` FFI.
//!
//! A fiber may only suspend itself (`Fiber::wait`) from its own running
//! stack; the currently-running fiber's `corosensei::Yielder` is stashed in
//! a thread-local for the duration of a resume so deeply nested calls (e.g.
//! `ResponseHandle::wait`) can reach it without threading a handle through
//! every signature, the way `wasmtime`'s fiber support stashes its
//! `Suspend` pointer for the duration of a poll.

pub mod condvar;

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::reactor::EventProcessor;

thread_local! {
    static CURRENT_YIELDER: Cell<*const Yielder<(), ()>> = const { Cell::new(std::ptr::null()) };
}

struct YielderGuard(*const Yielder<(), ()>);

impl YielderGuard {
    fn enter(yielder: &Yielder<(), ()>) -> YielderGuard {
        let previous = CURRENT_YIELDER.with(|cell| cell.replace(yielder as *const _));
        YielderGuard(previous)
    }
}

impl Drop for YielderGuard {
    fn drop(&mut self) {
        CURRENT_YIELDER.with(|cell| cell.set(self.0));
    }
}

type Body = Box<dyn FnOnce() + Send + 'static>;

/// A stackful coroutine pinned to one [`EventProcessor`]. Never migrates
/// (§5's "a fiber never migrates").
pub struct Fiber {
    coroutine: Mutex<Coroutine<(), (), ()>>,
    /// The processor this fiber is pinned to; `resume` enqueues onto its
    /// task queue rather than driving the coroutine inline, so a resume
    /// requested from any thread still only ever runs on this one.
    processor: Arc<EventProcessor>,
    /// Set while a resume is pending so at most one resume is ever
    /// in flight (§3's Fiber invariant).
    resume_pending: AtomicBool,
    done: AtomicBool,
}

/// A cloneable handle to a running or cached [`Fiber`].
#[derive(Clone)]
pub struct FiberHandle(pub(crate) Arc<Fiber>);

impl Fiber {
    fn new(processor: Arc<EventProcessor>, body: Body) -> Fiber {
        let coroutine = Coroutine::new(move |yielder: &Yielder<(), ()>, ()| {
            let _guard = YielderGuard::enter(yielder);
            body();
        });
        Fiber {
            coroutine: Mutex::new(coroutine),
            processor,
            resume_pending: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Starts a new fiber running `f` on `processor`'s thread. Must be
    /// called from that processor's own thread (resuming is never
    /// cross-thread).
    pub fn execute(processor: &Arc<EventProcessor>, f: impl FnOnce() + Send + 'static) -> FiberHandle {
        let handle = FiberHandle(Arc::new(Fiber::new(processor.clone(), Box::new(f))));
        handle.0.drive();
        handle
    }

    fn drive(self: &Arc<Fiber>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.resume_pending.store(false, Ordering::Release);
        let mut coroutine = self.coroutine.lock().unwrap();
        match coroutine.resume(()) {
            CoroutineResult::Yield(()) => {}
            CoroutineResult::Return(()) => {
                self.done.store(true, Ordering::Release);
            }
        }
    }

    /// Suspends the calling fiber. May only be called on the fiber's own
    /// stack — i.e. from inside the closure passed to [`Fiber::execute`],
    /// directly or through nested calls.
    pub fn wait(&self) {
        let yielder = CURRENT_YIELDER.with(|cell| cell.get());
        assert!(
            !yielder.is_null(),
            "Fiber::wait() called outside of a running fiber"
        );
        unsafe { &*yielder }.suspend(());
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl FiberHandle {
    /// Schedules resumption on the fiber's home processor via its
    /// [`crate::task_queue::TaskQueue`]. Ensures at most one resume is
    /// pending at a time (§3 invariant).
    pub fn resume(&self) {
        if self.0.resume_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let fiber = self.0.clone();
        fiber.processor.task_queue().execute(Box::new(move || {
            fiber.drive();
        }));
    }

    pub fn is_done(&self) -> bool {
        self.0.is_done()
    }
}

/// Per-processor bounded free list of terminated fibers' stacks, so
/// starting a new fiber doesn't always pay a fresh stack allocation.
pub struct FiberCache {
    free: Mutex<Vec<FiberHandle>>,
    cap: usize,
}

impl FiberCache {
    pub fn new(cap: usize) -> FiberCache {
        FiberCache {
            free: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    /// Returns a fiber to the cache if under cap and the fiber has no
    /// active stack frame; otherwise the caller must schedule its drop as a
    /// task on the owning processor (never on the dying fiber's own stack).
    pub fn reclaim(&self, handle: FiberHandle) -> Result<(), FiberHandle> {
        if !handle.is_done() {
            return Err(handle);
        }
        let mut free = self.free.lock().unwrap();
        if free.len() >= self.cap {
            return Err(handle);
        }
        free.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reactor::Poller;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fiber_runs_to_completion_without_suspending() {
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handle = Fiber::execute(&processor, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resume_is_enqueued_on_the_processors_task_queue_not_run_inline() {
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let handle = Fiber::execute(&processor, || {});
        assert!(handle.is_done());

        handle.resume();
        assert_eq!(processor.task_queue().queue().len(), 1);
        assert!(processor.task_queue().poll());
        assert_eq!(processor.task_queue().queue().len(), 0);
    }

    #[test]
    fn fiber_cache_rejects_unfinished_fiber() {
        let cache = FiberCache::new(4);
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let handle = Fiber::execute(&processor, || {});
        assert!(cache.reclaim(handle).is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fiber_cache_respects_capacity() {
        let cache = FiberCache::new(1);
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let a = Fiber::execute(&processor, || {});
        let b = Fiber::execute(&processor, || {});
        assert!(cache.reclaim(a).is_ok());
        assert!(cache.reclaim(b).is_err());
    }
}
