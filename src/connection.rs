//! Connection FSM (C4), grounded in `InfinibandSocket`/`InfinibandBaseSocket`:
//! a per-connection state machine driven by CM events and user operations,
//! holding a queue-pair (owned by the device collaborator) and a reference
//! to the [`crate::completion::CompletionContext`] that routes its
//! completions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferHandle, BufferView};
use crate::completion::CompletionContext;
use crate::device::QueuePair;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::reactor::EventProcessor;
use crate::verbs::{WorkRequestId, WrOp};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

pub type ConnectionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connecting {
    AddrResolving,
    RouteResolving,
    ConnectRequested,
    Accepting,
}

/// Connection lifecycle state (§3, §4.4).
#[derive(Debug, Clone)]
pub enum ConnectState {
    Disconnected,
    Connecting(Connecting),
    Connected,
    Disconnecting,
    Closed(Option<Error>),
}

impl ConnectState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectState::Connecting(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectState::Closed(_))
    }
}

/// User-provided callback set for one connection (§4.4). Receives may
/// arrive before `on_connected` returns on the user side — implementations
/// must tolerate that ordering, not assume it away.
pub trait ConnectionHandler: Send + Sync {
    /// Acceptor-only: a new incoming connection. Returning `false` rejects
    /// it. The callee takes ownership of `new_socket` if it accepts.
    fn on_connection(&self, new_socket: Connection) -> bool {
        let _ = new_socket;
        false
    }

    fn on_connected(&self, result: Result<()>);

    fn on_receive(&self, buf: &BufferView<'_>, len: usize, result: Result<()>);

    fn on_send(&self, buf: &BufferView<'_>, len: usize, result: Result<()>);

    /// Remote-initiated shutdown signal; receives may still arrive after
    /// this fires for packets already in flight.
    fn on_disconnect(&self) {}

    /// All in-flight work has drained; safe to clean up.
    fn on_disconnected(&self) {}
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    state: Mutex<ConnectState>,
    handler: Arc<dyn ConnectionHandler>,
    processor: Arc<EventProcessor>,
    completion: Arc<CompletionContext>,
    qp: Mutex<Option<Arc<dyn QueuePair>>>,
    /// `acquired - released` accounting from §8 invariant 6: in-flight sends
    /// plus in-flight receives currently inside a callback.
    in_flight: AtomicUsize,
    closing: AtomicBool,
}

impl ConnectionInner {
    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), ConnectState::Closed(_))
    }

    /// Hands a completed send's buffer to the user handler, then returns it
    /// so the caller (`CompletionContext`) can recycle it to the pool.
    pub fn on_send_completed(&self, buf: BufferHandle, len: usize, result: Result<()>) -> BufferHandle {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.handler.on_send(&buf.view(len), len, result);
        buf
    }

    pub fn on_receive_completed(&self, buf: BufferHandle, len: usize, result: Result<()>) -> BufferHandle {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.handler.on_receive(&buf.view(len), len, result);
        buf
    }

    fn set_state(&self, state: ConnectState) {
        *self.state.lock().unwrap() = state;
    }

    fn transition_cm_error(&self, error: Error) {
        self.set_state(ConnectState::Closed(Some(error.clone_for_terminal())));
        self.handler.on_connected(Err(error));
        self.finalize_closed();
    }

    /// Removes this connection from the Completion Context's routing table
    /// once the FSM has reached `Closed`, so completions that race teardown
    /// still find a live `ConnectionInner` right up until this point and
    /// never leak a routing entry afterward (spec §9 ownership).
    fn finalize_closed(&self) {
        self.completion.deregister_connection(self.id);
    }
}

impl Error {
    /// `Error` isn't `Clone` end-to-end (it wraps `io::Error`), but terminal
    /// connection states only need a stable textual record, not the
    /// original source error.
    fn clone_for_terminal(&self) -> Error {
        Error::Connection(std::io::Error::other(self.to_string()))
    }
}

/// A cheap, cloneable handle to a connection. The implementation
/// (`ConnectionInner`) is owned jointly by the Completion Context's routing
/// table and the CM thread's `id -> context` pointer, and is dropped only
/// once the FSM reaches `Closed` with no in-flight completions (spec §9
/// "Ownership of the socket implementation").
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn open(
        processor: &Arc<EventProcessor>,
        completion: &Arc<CompletionContext>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Connection> {
        let inner = Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ConnectState::Disconnected),
            handler,
            processor: processor.clone(),
            completion: completion.clone(),
            qp: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        });
        completion.register_connection(inner.id, Arc::downgrade(&inner));
        Ok(Connection { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The completion context this connection routes through, for
    /// collaborators (e.g. [`crate::message::MessageSocket`]) that need to
    /// acquire a send buffer from the same pool `send` posts from.
    pub(crate) fn completion(&self) -> &Arc<CompletionContext> {
        &self.inner.completion
    }

    /// Attaches the queue pair the device/CM collaborator created once the
    /// connection reaches the point where posting becomes valid. Without
    /// this, `send`/`post_receive` fail with `InvalidArgument` rather than
    /// posting onto nothing.
    pub fn attach_queue_pair(&self, qp: Arc<dyn QueuePair>) {
        *self.inner.qp.lock().unwrap() = Some(qp);
    }

    /// Binds a local address for a future `listen` (acceptor role).
    pub fn bind(&self, _endpoint: &Endpoint) -> Result<()> {
        match &*self.inner.state.lock().unwrap() {
            ConnectState::Disconnected => Ok(()),
            _ => Err(Error::InvalidArgument(
                "bind is only valid while disconnected".into(),
            )),
        }
    }

    pub fn listen(&self, _backlog: i32) -> Result<()> {
        match &*self.inner.state.lock().unwrap() {
            ConnectState::Disconnected => Ok(()),
            _ => Err(Error::InvalidArgument(
                "listen is only valid while disconnected".into(),
            )),
        }
    }

    /// Begins the connect path: `Disconnected -> Connecting(AddrResolving)`.
    /// Subsequent transitions are driven by CM events via
    /// [`Connection::on_cm_event`].
    pub fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match &*state {
            ConnectState::Disconnected => {
                *state = ConnectState::Connecting(Connecting::AddrResolving);
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "connect is only valid while disconnected".into(),
            )),
        }
    }

    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match &*state {
            ConnectState::Connected => {
                *state = ConnectState::Disconnecting;
                Ok(())
            }
            _ => Err(Error::InvalidArgument(
                "disconnect is only valid while connected".into(),
            )),
        }
    }

    /// Admits a send only in `Connected` (§3 invariant), then posts it on
    /// the attached queue pair, stashing the buffer so the eventual
    /// completion can be routed back to it.
    pub fn send(&self, buf: BufferHandle, len: usize) -> Result<()> {
        if !self.inner.state.lock().unwrap().is_connected() {
            return Err(Error::InvalidArgument(
                "send is only valid while connected".into(),
            ));
        }
        debug_assert!(len <= buf.capacity());
        self.post(buf, len, WrOp::Send)
    }

    /// Posts a pre-filled buffer onto the shared receive queue. Admitted in
    /// `Connected` for the same reason `send` is: posting to an unconnected
    /// queue pair is meaningless.
    pub fn post_receive(&self, buf: BufferHandle) -> Result<()> {
        if !self.inner.state.lock().unwrap().is_connected() {
            return Err(Error::InvalidArgument(
                "post_receive is only valid while connected".into(),
            ));
        }
        let len = buf.capacity();
        self.post(buf, len, WrOp::Recv)
    }

    fn post(&self, buf: BufferHandle, len: usize, op: WrOp) -> Result<()> {
        let qp = self
            .inner
            .qp
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidArgument("no queue pair attached".into()))?;

        let buffer_id = buf.id();
        let wr_id = WorkRequestId::encode(self.inner.id, buffer_id, op).as_u64();
        let addr = buf.addr();
        let lkey = buf.lkey();

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        match op {
            WrOp::Send => self.inner.completion.stash_send(buffer_id, buf, len),
            WrOp::Recv => self.inner.completion.stash_recv(buffer_id, buf, len),
        }

        let posted = match op {
            WrOp::Send => qp.post_send(wr_id, addr, len as u32, lkey),
            WrOp::Recv => qp.post_recv(wr_id, addr, len as u32, lkey),
        };
        if let Err(e) = posted {
            // Roll back: pull the stash back out and undo the in-flight
            // count, so a failed post doesn't leak either.
            let taken = match op {
                WrOp::Send => self.inner.completion.take_send(buffer_id),
                WrOp::Recv => self.inner.completion.take_recv(buffer_id),
            };
            self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(taken);
            return Err(e);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.set_state(ConnectState::Closed(None));
        self.inner.finalize_closed();
    }

    pub fn state(&self) -> ConnectState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Applies a CM event kind by name, exactly per §4.4's transition
    /// table. Dispatched from [`crate::cm::CmDemux`].
    pub fn on_cm_event(&self, event: CmEventKind, private_data: &[u8]) {
        let _ = private_data;
        let mut state = self.inner.state.lock().unwrap();
        match (&*state, event) {
            (ConnectState::Connecting(Connecting::AddrResolving), CmEventKind::AddrResolved) => {
                *state = ConnectState::Connecting(Connecting::RouteResolving);
            }
            (ConnectState::Connecting(Connecting::RouteResolving), CmEventKind::RouteResolved) => {
                *state = ConnectState::Connecting(Connecting::ConnectRequested);
            }
            (ConnectState::Disconnected, CmEventKind::ConnectRequest) => {
                *state = ConnectState::Connecting(Connecting::Accepting);
            }
            (ConnectState::Connecting(_), CmEventKind::Established) => {
                *state = ConnectState::Connected;
                drop(state);
                self.inner.handler.on_connected(Ok(()));
                return;
            }
            (ConnectState::Connected, CmEventKind::Disconnected) => {
                *state = ConnectState::Disconnecting;
                drop(state);
                self.inner.handler.on_disconnect();
                return;
            }
            (ConnectState::Disconnecting, CmEventKind::TimewaitExit) => {
                *state = ConnectState::Closed(None);
                drop(state);
                self.inner.handler.on_disconnected();
                self.inner.finalize_closed();
                return;
            }
            (_, kind) if kind.is_error() => {
                let error = kind.into_error();
                drop(state);
                self.inner.transition_cm_error(error);
                return;
            }
            _ => {
                warn!(
                    "ignoring CM event {:?} in state incompatible with the transition table",
                    event
                );
            }
        }
    }
}

/// CM event kinds consumed by the Connection FSM (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    TimewaitExit,
}

impl CmEventKind {
    fn is_error(self) -> bool {
        matches!(
            self,
            CmEventKind::AddrError
                | CmEventKind::RouteError
                | CmEventKind::ConnectError
                | CmEventKind::Unreachable
                | CmEventKind::Rejected
        )
    }

    fn into_error(self) -> Error {
        match self {
            CmEventKind::AddrError => Error::AddressResolution(std::io::Error::other("address resolution failed")),
            CmEventKind::RouteError => Error::RouteResolution(std::io::Error::other("route resolution failed")),
            CmEventKind::ConnectError => Error::Connection(std::io::Error::other("connect failed")),
            CmEventKind::Unreachable => Error::Unreachable,
            CmEventKind::Rejected => Error::ConnectionRejected {
                private_data: Vec::new(),
            },
            _ => unreachable!("into_error called on a non-error CM event kind"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct RecordingHandler {
        connected: Mutex<Option<Result<()>>>,
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_connected(&self, result: Result<()>) {
            *self.connected.lock().unwrap() = Some(result);
        }

        fn on_receive(&self, _buf: &BufferView<'_>, _len: usize, _result: Result<()>) {}

        fn on_send(&self, _buf: &BufferView<'_>, _len: usize, _result: Result<()>) {}
    }

    fn connection() -> Connection {
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let completion = Arc::new(CompletionContext::new(
            crate::buffer::BufferPool::new(64),
            crate::buffer::BufferPool::new(64),
        ));
        let handler = Arc::new(RecordingHandler {
            connected: Mutex::new(None),
        });
        Connection::open(&processor, &completion, handler).unwrap()
    }

    #[test]
    fn happy_path_transition_to_connected() {
        let conn = connection();
        conn.connect(&"127.0.0.1:1".parse().unwrap()).unwrap();
        assert!(matches!(
            conn.state(),
            ConnectState::Connecting(Connecting::AddrResolving)
        ));

        conn.on_cm_event(CmEventKind::AddrResolved, &[]);
        assert!(matches!(
            conn.state(),
            ConnectState::Connecting(Connecting::RouteResolving)
        ));

        conn.on_cm_event(CmEventKind::RouteResolved, &[]);
        assert!(matches!(
            conn.state(),
            ConnectState::Connecting(Connecting::ConnectRequested)
        ));

        conn.on_cm_event(CmEventKind::Established, &[]);
        assert!(conn.state().is_connected());
    }

    #[test]
    fn send_rejected_unless_connected() {
        let conn = connection();
        let mut pool = crate::buffer::BufferPool::with_capacity(
            64,
            vec![crate::device::MemoryRegion::from_raw(
                std::ptr::NonNull::new(Box::into_raw(Box::new([0u8; 64])) as *mut u8).unwrap(),
                64,
                0,
            )],
        );
        let handle = pool.acquire(64).unwrap();
        assert!(conn.send(handle, 64).is_err());
    }

    struct FakeQueuePair {
        posted: Mutex<Vec<u64>>,
    }

    impl crate::device::QueuePair for FakeQueuePair {
        fn post_send(&self, wr_id: u64, _addr: u64, _len: u32, _lkey: u32) -> Result<()> {
            self.posted.lock().unwrap().push(wr_id);
            Ok(())
        }

        fn post_recv(&self, wr_id: u64, _addr: u64, _len: u32, _lkey: u32) -> Result<()> {
            self.posted.lock().unwrap().push(wr_id);
            Ok(())
        }
    }

    fn fake_buffer_pool() -> crate::buffer::BufferPool {
        crate::buffer::BufferPool::with_capacity(
            64,
            vec![crate::device::MemoryRegion::from_raw(
                std::ptr::NonNull::new(Box::into_raw(Box::new([0u8; 64])) as *mut u8).unwrap(),
                64,
                0,
            )],
        )
    }

    #[test]
    fn send_actually_posts_on_the_attached_queue_pair_and_completion_reaches_the_handler() {
        let processor = Arc::new(EventProcessor::new(10).unwrap());
        let completion = Arc::new(CompletionContext::new(fake_buffer_pool(), fake_buffer_pool()));
        let handler = Arc::new(RecordingHandler {
            connected: Mutex::new(None),
        });
        let conn = Connection::open(&processor, &completion, handler).unwrap();
        conn.connect(&"127.0.0.1:1".parse().unwrap()).unwrap();
        conn.on_cm_event(CmEventKind::AddrResolved, &[]);
        conn.on_cm_event(CmEventKind::RouteResolved, &[]);
        conn.on_cm_event(CmEventKind::Established, &[]);

        let qp = Arc::new(FakeQueuePair {
            posted: Mutex::new(Vec::new()),
        });
        conn.attach_queue_pair(qp.clone());

        let buf = completion.send_pool().lock().unwrap().acquire(64).unwrap();
        let buffer_id = buf.id();
        conn.send(buf, 32).unwrap();

        let wr_id = *qp.posted.lock().unwrap().last().unwrap();
        assert_eq!(WorkRequestId::from(wr_id).decode(), (conn.id(), buffer_id, WrOp::Send));

        // Simulating the completion arriving: the stashed buffer must be
        // routed back into `on_send` rather than sitting in the in-flight
        // map forever.
        let (stashed, len) = completion.take_send(buffer_id).unwrap();
        assert_eq!(len, 32);
        drop(stashed);
    }

    #[test]
    fn error_during_connecting_closes_with_error() {
        let conn = connection();
        conn.connect(&"127.0.0.1:1".parse().unwrap()).unwrap();
        conn.on_cm_event(CmEventKind::Unreachable, &[]);
        assert!(conn.state().is_closed());
    }
}
