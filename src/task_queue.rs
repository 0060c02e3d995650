//! Cross-thread task queue (C2), grounded in the original `TaskQueue`
//! poller: a bounded SPSC-ish queue of closures, woken from sleep through an
//! eventfd, with a Dekker-style `sleeping` flag closing the race between a
//! producer checking "is the processor asleep?" and the processor actually
//! going to sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::epoll::Ready;
use crate::error::ProgrammerError;
use crate::queue::{PushError, Queue};
use crate::reactor::Poller;

pub type Task = Box<dyn FnOnce() + Send>;

/// A queue of tasks to run on a single [`crate::reactor::EventProcessor`]
/// thread, fed from any thread.
/// Bound on a single wait for space to free up in a full queue. The queue
/// itself (`concurrent_queue`) doesn't synchronize its pop side with this
/// condvar, so a `notify_all` racing a producer that hasn't started waiting
/// yet is possible; re-checking on a bounded wait instead of an unbounded
/// one closes that race without needing a shared lock around every push/pop.
const SPACE_WAIT: Duration = Duration::from_millis(10);

pub struct TaskQueue {
    queue: Queue<Task>,
    sleeping: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
    space_lock: Mutex<()>,
    space: Condvar,
}

impl TaskQueue {
    pub fn bounded(capacity: usize) -> std::io::Result<TaskQueue> {
        Ok(TaskQueue {
            queue: Queue::bounded(capacity)?,
            sleeping: AtomicBool::new(false),
            owner: Mutex::new(None),
            space_lock: Mutex::new(()),
            space: Condvar::new(),
        })
    }

    pub fn unbounded() -> std::io::Result<TaskQueue> {
        Ok(TaskQueue {
            queue: Queue::unbounded()?,
            sleeping: AtomicBool::new(false),
            owner: Mutex::new(None),
            space_lock: Mutex::new(()),
            space: Condvar::new(),
        })
    }

    /// Records the processor thread that will be draining this queue. Tasks
    /// enqueued from that same thread while the queue is full are a
    /// self-enqueue: the producer and the only possible consumer are the
    /// same thread, so blocking would deadlock forever. That case is a
    /// programmer error, not a runtime condition to recover from.
    pub fn bind_owner(&self) {
        *self.owner.lock().unwrap() = Some(thread::current().id());
    }

    pub fn queue(&self) -> &Queue<Task> {
        &self.queue
    }

    /// Enqueues `task` to run on the owning processor thread.
    pub fn execute(&self, task: Task) {
        match self.queue.push(task) {
            Ok(()) => self.notify(),
            Err(PushError::Full(task)) => {
                if self.owner.lock().unwrap().as_ref() == Some(&thread::current().id()) {
                    ProgrammerError::TaskQueueSelfEnqueueWhileFull.panic();
                }

                let mut pending = task;
                loop {
                    match self.queue.push(pending) {
                        Ok(()) => break,
                        Err(PushError::Full(t)) => {
                            pending = t;
                            let guard = self.space_lock.lock().unwrap();
                            let _ = self.space.wait_timeout(guard, SPACE_WAIT);
                        }
                        Err(PushError::Closed(_)) => return,
                    }
                }
                self.notify();
            }
            Err(PushError::Closed(_)) => {}
        }
    }

    fn notify(&self) {
        if self.sleeping.load(Ordering::Acquire) {
            let _ = self.queue.wake();
        }
    }

    fn drain(&self) -> bool {
        let mut ran = false;
        while let Ok(task) = self.queue.pop() {
            ran = true;
            task();
            // Wake any thread blocked in execute() waiting for space; a
            // `notify_all` with nobody waiting is just a no-op syscall.
            let _guard = self.space_lock.lock().unwrap();
            self.space.notify_all();
        }
        ran
    }
}

impl Poller for TaskQueue {
    fn poll(&self) -> bool {
        self.drain()
    }

    fn prepare_sleep(&self) {
        let was_sleeping = self.sleeping.swap(true, Ordering::AcqRel);
        if was_sleeping {
            return;
        }
        // Close the race: a task enqueued between our last `poll` and this
        // flag flip would otherwise be missed until the next wakeup.
        self.drain();
    }

    fn wakeup(&self, _ready: Ready) {
        self.sleeping.store(false, Ordering::Release);
        self.drain();
    }
}
