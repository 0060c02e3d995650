//! Single-threaded busy-poll/epoll event loop (C1), grounded in the
//! `EventProcessor`/`EventPoll` pair from the original implementation: a
//! fixed number of tight poll rounds across every registered [`Poller`],
//! then an edge-triggered `epoll_wait` sleep once nothing has fired for a
//! whole round.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::IndexMap;

use crate::epoll::{Epoll, EpollOpt, Events, Ready, Source, Token};
use crate::task_queue::TaskQueue;

/// An event source the processor drives every poll round, and wakes
/// directly from `epoll_wait` once it has gone to sleep.
pub trait Poller: Send + Sync {
    /// Polls for new events, processing as many as are immediately
    /// available. Returns whether anything was processed — a `true` result
    /// resets the processor's busy-poll counter.
    fn poll(&self) -> bool;

    /// Called once, for every poller, right before the processor goes to
    /// `epoll_wait` sleep.
    fn prepare_sleep(&self);

    /// Called when `epoll_wait` reports readiness for this poller's fd.
    fn wakeup(&self, ready: Ready);
}

struct Registration {
    poller: Arc<dyn Poller>,
}

/// Drives registered [`Poller`]s from a single OS thread.
pub struct EventProcessor {
    epoll: Epoll,
    poll_cycles: u32,
    pollers: Mutex<IndexMap<Token, Registration>>,
    next_token: AtomicUsize,
    /// Every processor owns exactly one task queue and registers it as a
    /// regular poller, so cross-thread work (fiber resumption, among other
    /// things — §4.6) always has somewhere to land.
    task_queue: Arc<TaskQueue>,
}

impl EventProcessor {
    pub fn new(poll_cycles: u32) -> io::Result<EventProcessor> {
        let processor = EventProcessor {
            epoll: Epoll::new()?,
            poll_cycles,
            pollers: Mutex::new(IndexMap::new()),
            next_token: AtomicUsize::new(0),
            task_queue: Arc::new(TaskQueue::unbounded()?),
        };
        let task_queue = processor.task_queue.clone();
        processor.register(task_queue.queue(), task_queue as Arc<dyn Poller>)?;
        Ok(processor)
    }

    /// The task queue fed from any thread and drained on this processor's
    /// own thread.
    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.task_queue
    }

    /// Registers a new poller, returning the token it was registered under.
    /// Edge-triggered, matching the original's `EPOLLIN | EPOLLET`.
    pub fn register<S>(&self, source: &S, poller: Arc<dyn Poller>) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.epoll
            .add(source, token, Ready::readable(), EpollOpt::edge())?;
        self.pollers
            .lock()
            .unwrap()
            .insert(token, Registration { poller });
        Ok(token)
    }

    pub fn deregister<S>(&self, source: &S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.pollers.lock().unwrap().shift_remove(&token);
        self.epoll.delete(source)
    }

    /// Spawns the poll loop on its own thread, matching `EventProcessor::start`.
    pub fn spawn(processor: Arc<EventProcessor>) -> JoinHandle<()> {
        thread::spawn(move || {
            processor.task_queue.bind_owner();
            loop {
                processor.do_poll();
            }
        })
    }

    /// Runs a single busy-poll-then-sleep cycle; exposed directly for tests
    /// that want deterministic single-step control instead of a background
    /// thread.
    pub fn do_poll(&self) {
        let mut idle_rounds = 0u32;
        while idle_rounds < self.poll_cycles {
            let mut any = false;
            let pollers: Vec<Arc<dyn Poller>> = self
                .pollers
                .lock()
                .unwrap()
                .values()
                .map(|r| r.poller.clone())
                .collect();
            for poller in &pollers {
                if poller.poll() {
                    any = true;
                }
            }
            if any {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
            }
        }

        let pollers: Vec<Arc<dyn Poller>> = self
            .pollers
            .lock()
            .unwrap()
            .values()
            .map(|r| r.poller.clone())
            .collect();
        for poller in &pollers {
            poller.prepare_sleep();
        }

        debug!("going to epoll sleep");
        let mut events = Events::with_capacity(pollers.len().max(1));
        // Blocks indefinitely: every registered poller got a `prepare_sleep`
        // call above, so the only way out is a real wakeup on one of their
        // fds (spec §4.1 step 2 — no polling timeout once the budget's
        // exhausted).
        let num = match self.epoll.wait(&mut events, None) {
            Ok(num) => num,
            Err(e) => {
                error!("epoll_wait failed: {}", e);
                return;
            }
        };
        debug!("wake up from epoll sleep with {} events", num);

        let map = self.pollers.lock().unwrap();
        for event in &events {
            let ready = event.readiness();
            if ready.is_error() || ready.is_hup() {
                error!("error on registered fd for token {:?}", event.token());
                continue;
            }
            if let Some(registration) = map.get(&event.token()) {
                registration.poller.wakeup(ready);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct CountingPoller {
        fired: AtomicBool,
    }

    impl Poller for CountingPoller {
        fn poll(&self) -> bool {
            self.fired.swap(false, Ordering::SeqCst)
        }

        fn prepare_sleep(&self) {}

        fn wakeup(&self, _ready: Ready) {}
    }

    #[test]
    fn do_poll_blocks_until_woken_by_a_task_enqueued_from_another_thread() {
        let processor = Arc::new(EventProcessor::new(4).unwrap());
        // Nothing is enqueued during the busy-poll phase, so do_poll must
        // fall through to a blocking epoll_wait(None) and stay there until
        // this spawned thread wakes it — there is no timeout to fall back
        // on, matching the real poll loop.
        let waker = processor.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.task_queue().execute(Box::new(|| {}));
        });
        let start = std::time::Instant::now();
        processor.do_poll();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
