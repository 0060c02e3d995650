//! Completion Context (C3): drains the verbs completion queue and routes
//! each completion back to the Connection FSM it belongs to, by decoding
//! the work-request id the send/receive was posted with (§4.3).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, Weak};

use crate::buffer::{BufferHandle, BufferPool};
use crate::connection::ConnectionInner;
use crate::epoll::Ready;
use crate::reactor::Poller;
use crate::verbs::{wc_to_result, Wc, WrOp};

/// Bound on how many completions a single `poll()` call drains before
/// yielding back to the processor, so one noisy connection can't starve the
/// other registered pollers.
const MAX_BATCH: usize = 64;

type ConnectionId = u32;

/// Abstraction over the blocking completion-queue channel, mirroring
/// [`crate::cm::CmEventSource`]'s role for CM events: lets
/// [`CompletionContext`] be driven from a real `ibv_cq`/`ibv_comp_channel`
/// pair in production and left unattached in tests.
pub trait CompletionSource: Send + Sync {
    /// The completion channel's fd, registered with the reactor so its
    /// readiness wakes [`CompletionContext::wakeup`].
    fn fd(&self) -> RawFd;

    /// Non-blocking drain: fills `wc` with up to `wc.len()` ready
    /// completions, returning how many were filled.
    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize>;

    /// Re-arms the channel to fire once more work completes. Called before
    /// the owning processor goes to sleep.
    fn request_notify(&self) -> io::Result<()>;

    /// Drains and acknowledges the one notification event that made the
    /// channel's fd readable. Called on wakeup, before polling again.
    fn ack_event(&self) -> io::Result<()>;
}

/// Owns the send/receive buffer pools and the completion-queue polling
/// logic. Registered as a [`Poller`] with an [`crate::reactor::EventProcessor`].
pub struct CompletionContext {
    send_pool: Mutex<BufferPool>,
    recv_pool: Mutex<BufferPool>,
    connections: Mutex<HashMap<ConnectionId, Weak<ConnectionInner>>>,
    in_flight_send: Mutex<HashMap<u32, (BufferHandle, usize)>>,
    in_flight_recv: Mutex<HashMap<u32, (BufferHandle, usize)>>,
    source: Mutex<Option<Box<dyn CompletionSource>>>,
}

impl CompletionContext {
    pub fn new(send_pool: BufferPool, recv_pool: BufferPool) -> CompletionContext {
        CompletionContext {
            send_pool: Mutex::new(send_pool),
            recv_pool: Mutex::new(recv_pool),
            connections: Mutex::new(HashMap::new()),
            in_flight_send: Mutex::new(HashMap::new()),
            in_flight_recv: Mutex::new(HashMap::new()),
            source: Mutex::new(None),
        }
    }

    /// Attaches the real completion channel once the device collaborator
    /// has created it. Without this, `poll()`/`prepare_sleep()`/`wakeup()`
    /// are correct no-ops: there is nothing to drain.
    pub fn attach_source(&self, source: Box<dyn CompletionSource>) {
        *self.source.lock().unwrap() = Some(source);
    }

    pub fn source_fd(&self) -> Option<RawFd> {
        self.source.lock().unwrap().as_ref().map(|s| s.fd())
    }

    /// Called by `Connection::open` to make completions for this connection
    /// routable; the entry is removed once the FSM reaches `Closed`.
    pub fn register_connection(&self, id: ConnectionId, inner: Weak<ConnectionInner>) {
        self.connections.lock().unwrap().insert(id, inner);
    }

    pub fn deregister_connection(&self, id: ConnectionId) {
        self.connections.lock().unwrap().remove(&id);
    }

    pub fn send_pool(&self) -> &Mutex<BufferPool> {
        &self.send_pool
    }

    pub fn recv_pool(&self) -> &Mutex<BufferPool> {
        &self.recv_pool
    }

    /// Records a just-posted send buffer so the completion that eventually
    /// arrives for it can be turned back into a [`crate::buffer::BufferView`].
    pub(crate) fn stash_send(&self, id: u32, buf: BufferHandle, posted_len: usize) {
        self.in_flight_send.lock().unwrap().insert(id, (buf, posted_len));
    }

    pub(crate) fn take_send(&self, id: u32) -> Option<(BufferHandle, usize)> {
        self.in_flight_send.lock().unwrap().remove(&id)
    }

    pub(crate) fn stash_recv(&self, id: u32, buf: BufferHandle, posted_len: usize) {
        self.in_flight_recv.lock().unwrap().insert(id, (buf, posted_len));
    }

    pub(crate) fn take_recv(&self, id: u32) -> Option<(BufferHandle, usize)> {
        self.in_flight_recv.lock().unwrap().remove(&id)
    }

    /// Drains up to `MAX_BATCH` completions, routing each to its owning
    /// connection. Returns whether any completion was processed.
    fn drain(&self, completions: impl Iterator<Item = Wc>) -> bool {
        let mut any = false;
        for (n, wc) in completions.enumerate() {
            if n >= MAX_BATCH {
                break;
            }
            any = true;
            self.dispatch(wc);
        }
        any
    }

    fn dispatch(&self, wc: Wc) {
        let (connection_id, buffer_id, op) = wc.wr_id().decode();
        let result = wc_to_result(&wc).map(|_| ());
        let received = wc.bytes();

        let slot = match op {
            WrOp::Send => self.take_send(buffer_id),
            WrOp::Recv => self.take_recv(buffer_id),
        };
        let Some((buf, posted_len)) = slot else {
            warn!(
                "completion for {:?} buffer {} with no in-flight record",
                op, buffer_id
            );
            return;
        };

        let connection = {
            let map = self.connections.lock().unwrap();
            map.get(&connection_id).and_then(Weak::upgrade)
        };

        let buf = match connection {
            Some(connection) if !connection.is_closed() => {
                // A send's length is what the caller asked to post; a
                // receive's is what the wire actually delivered (§4.3).
                let len = match op {
                    WrOp::Send => posted_len,
                    WrOp::Recv => received,
                };
                match op {
                    WrOp::Send => connection.on_send_completed(buf, len, result),
                    WrOp::Recv => connection.on_receive_completed(buf, len, result),
                }
            }
            // No longer routable (or never was): still recycle the buffer,
            // per §4.3's teardown invariant.
            _ => buf,
        };
        self.recycle(op, buf);
    }

    fn recycle(&self, op: WrOp, buf: BufferHandle) {
        let id = buf.id();
        let region = buf.region();
        match op {
            WrOp::Send => self.send_pool.lock().unwrap().release(id, region),
            WrOp::Recv => self.recv_pool.lock().unwrap().release(id, region),
        }
    }
}

impl Poller for CompletionContext {
    fn poll(&self) -> bool {
        let source = self.source.lock().unwrap();
        let Some(source) = source.as_ref() else {
            return false;
        };
        let mut wc = [Wc(unsafe { std::mem::zeroed() }); MAX_BATCH];
        match source.poll_into(&mut wc) {
            Ok(0) => false,
            Ok(n) => {
                drop(source);
                self.drain(wc[..n].iter().copied())
            }
            Err(e) => {
                error!("ibv_poll_cq failed: {}", e);
                false
            }
        }
    }

    fn prepare_sleep(&self) {
        if let Some(source) = self.source.lock().unwrap().as_ref() {
            if let Err(e) = source.request_notify() {
                error!("ibv_req_notify_cq failed: {}", e);
            }
        }
    }

    fn wakeup(&self, _ready: Ready) {
        if let Some(source) = self.source.lock().unwrap().as_ref() {
            if let Err(e) = source.ack_event() {
                error!("ibv_get_cq_event failed: {}", e);
                return;
            }
        }
        // Drain whatever caused the notification before the processor's
        // next sleep re-arms it.
        while self.poll() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dispatch_to_missing_connection_does_not_panic() {
        let ctx = CompletionContext::new(BufferPool::new(4096), BufferPool::new(4096));
        assert!(!ctx.drain(std::iter::empty()));
    }

    #[test]
    fn poll_without_a_source_is_a_harmless_no_op() {
        let ctx = CompletionContext::new(BufferPool::new(4096), BufferPool::new(4096));
        assert!(ctx.source_fd().is_none());
        assert!(!ctx.poll());
        ctx.prepare_sleep();
        ctx.wakeup(Ready::empty());
    }

    #[test]
    fn completion_for_unstashed_buffer_is_dropped_without_a_connection_lookup() {
        let ctx = CompletionContext::new(BufferPool::new(4096), BufferPool::new(4096));
        let wr_id = crate::verbs::WorkRequestId::encode(1, 0, WrOp::Send).as_u64();
        let mut raw: rdma_sys::ibv_wc = unsafe { std::mem::zeroed() };
        raw.wr_id = wr_id;
        // No stash_send() ever happened for buffer 0: dispatch must warn and
        // return instead of panicking on the missing in-flight record.
        ctx.dispatch(Wc(raw));
    }
}
