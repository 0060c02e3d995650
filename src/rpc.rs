//! RPC Client Socket (C7): request/response correlation over a
//! [`crate::message::MessageSocket`] — a FIFO table for synchronous
//! requests, a keyed table for asynchronous ones, and condition-variable
//! backpressure gating (§4.7).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::fiber::condvar::ConditionVariable;
use crate::fiber::FiberHandle;
use crate::message::MessageSocket;

/// Sentinel `message_type` marking the server error envelope (§6).
pub const ERROR_MESSAGE_TYPE: u32 = u32::MAX;

/// A 31-bit user id plus the 1-bit async flag selecting a correlation
/// table, packed into the 64-bit message id (§3).
pub fn encode_message_id(user_id: u32, is_async: bool) -> u64 {
    debug_assert!(user_id <= 0x7FFF_FFFF);
    ((user_id as u64) << 1) | (is_async as u64)
}

pub fn decode_message_id(message_id: u64) -> (u32, bool) {
    ((message_id >> 1) as u32, message_id & 1 != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Pending,
    DoneOk,
    DoneErr,
    Retrieved,
}

struct ResponseInner<T> {
    state: Mutex<ResponseState>,
    value: Mutex<Option<T>>,
    error: Mutex<Option<Error>>,
    waiter: Mutex<Option<FiberHandle>>,
}

/// A shared handle to an in-flight request's eventual outcome. Shared
/// between the calling fiber and the correlation table (§9 "shared-pointer
/// graphs"); completion paths remove the table entry before calling the
/// setter, breaking the cycle.
pub struct ResponseHandle<T> {
    inner: Arc<ResponseInner<T>>,
}

impl<T> Clone for ResponseHandle<T> {
    fn clone(&self) -> ResponseHandle<T> {
        ResponseHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ResponseHandle<T> {
    fn pending() -> ResponseHandle<T> {
        ResponseHandle {
            inner: Arc::new(ResponseInner {
                state: Mutex::new(ResponseState::Pending),
                value: Mutex::new(None),
                error: Mutex::new(None),
                waiter: Mutex::new(None),
            }),
        }
    }

    fn set_waiter(&self, fiber: FiberHandle) {
        *self.inner.waiter.lock().unwrap() = Some(fiber);
    }

    fn complete_ok(&self, value: T) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != ResponseState::Pending {
            return;
        }
        *self.inner.value.lock().unwrap() = Some(value);
        *state = ResponseState::DoneOk;
        drop(state);
        self.wake();
    }

    fn complete_err(&self, error: Error) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != ResponseState::Pending {
            return;
        }
        *self.inner.error.lock().unwrap() = Some(error);
        *state = ResponseState::DoneErr;
        drop(state);
        self.wake();
    }

    fn wake(&self) {
        if let Some(waiter) = self.inner.waiter.lock().unwrap().take() {
            waiter.resume();
        }
    }

    pub fn done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), ResponseState::Pending)
    }

    /// Suspends `fiber` until the response is done.
    pub fn wait(&self, fiber: &FiberHandle) {
        if self.done() {
            return;
        }
        self.set_waiter(fiber.clone());
        crate::fiber::Fiber::wait(&fiber.0);
    }

    /// Retrieves the result, consuming the one-shot `Retrieved` transition.
    /// Panics with `result_already_retrieved` on reuse (§7).
    pub fn get(&self) -> Result<T> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            ResponseState::DoneOk => {
                *state = ResponseState::Retrieved;
                drop(state);
                Ok(self.inner.value.lock().unwrap().take().unwrap())
            }
            ResponseState::DoneErr => {
                *state = ResponseState::Retrieved;
                drop(state);
                Err(self.inner.error.lock().unwrap().take().unwrap())
            }
            ResponseState::Pending => panic!("response not yet done"),
            ResponseState::Retrieved => {
                crate::error::ProgrammerError::ResultAlreadyRetrieved.panic()
            }
        }
    }
}

/// Decodes a received message payload into the handler's response type.
/// The original `RpcClient`'s error-category template parameter is kept
/// here as an associated `Error` type rather than a free type parameter.
pub trait RpcHandler: Send + Sync {
    type Response: Send;
    type Error: Into<Error>;

    const MESSAGE_TYPE: u32;

    fn process_response(&self, payload: &[u8]) -> std::result::Result<Self::Response, Self::Error>;
}

struct SyncEntry<T> {
    user_id: u32,
    response: ResponseHandle<T>,
}

/// Request/response correlation over one [`MessageSocket`] (§4.7).
pub struct RpcClientSocket<H: RpcHandler> {
    socket: Arc<MessageSocket>,
    handler: H,
    sync_table: Mutex<VecDeque<SyncEntry<H::Response>>>,
    async_table: Mutex<IndexMap<u32, ResponseHandle<H::Response>>>,
    next_sync_id: AtomicU32,
    next_user_id: AtomicU32,
    sync_pending: AtomicUsize,
    max_pending: usize,
    gate: ConditionVariable,
}

impl<H: RpcHandler> RpcClientSocket<H> {
    pub fn new(socket: Arc<MessageSocket>, handler: H, max_pending: usize) -> RpcClientSocket<H> {
        RpcClientSocket {
            socket,
            handler,
            sync_table: Mutex::new(VecDeque::new()),
            async_table: Mutex::new(IndexMap::new()),
            next_sync_id: AtomicU32::new(0),
            next_user_id: AtomicU32::new(0),
            sync_pending: AtomicUsize::new(0),
            max_pending,
            gate: ConditionVariable::new(),
        }
    }

    fn connected(&self) -> bool {
        !self.socket.connection().state().is_connecting()
    }

    /// Synchronous request: gated on `state != Connecting` AND
    /// `sync_pending < maxPending` (§4.7).
    pub fn call_sync(&self, fiber: &FiberHandle, payload: &[u8]) -> ResponseHandle<H::Response> {
        self.gate.wait(fiber, || {
            self.connected() && self.sync_pending.load(Ordering::Acquire) < self.max_pending
        });

        let response = ResponseHandle::pending();
        if !self.connected() {
            response.complete_err(Error::ConnectionAborted);
            return response;
        }

        let user_id = self.next_sync_id.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF;
        self.sync_table.lock().unwrap().push_back(SyncEntry {
            user_id,
            response: response.clone(),
        });
        self.sync_pending.fetch_add(1, Ordering::AcqRel);

        let message_id = encode_message_id(user_id, false);
        if let Err(e) = self
            .socket
            .send_message(message_id, H::MESSAGE_TYPE, payload)
        {
            self.fail_sync(user_id, e);
        }
        response
    }

    /// Asynchronous request: gated only on `state != Connecting` (§4.7).
    pub fn call_async(
        &self,
        fiber: &FiberHandle,
        user_id: u32,
        payload: &[u8],
    ) -> ResponseHandle<H::Response> {
        self.gate.wait(fiber, || self.connected());

        let response = ResponseHandle::pending();
        if !self.connected() {
            response.complete_err(Error::ConnectionAborted);
            return response;
        }

        self.async_table
            .lock()
            .unwrap()
            .insert(user_id, response.clone());

        let message_id = encode_message_id(user_id, true);
        if let Err(e) = self
            .socket
            .send_message(message_id, H::MESSAGE_TYPE, payload)
        {
            self.async_table.lock().unwrap().shift_remove(&user_id);
            response.complete_err(e);
        }
        response
    }

    fn fail_sync(&self, user_id: u32, error: Error) {
        let mut table = self.sync_table.lock().unwrap();
        if let Some(pos) = table.iter().position(|e| e.user_id == user_id) {
            let entry = table.remove(pos).unwrap();
            drop(table);
            self.sync_pending.fetch_sub(1, Ordering::AcqRel);
            entry.response.complete_err(error);
            self.gate.notify_all();
        }
    }

    /// Dispatches a received message to the correct table, implementing the
    /// sync FIFO pop-and-retry loop and async keyed lookup (§4.7).
    pub fn on_message(&self, _message_id: u64, message_type: u32, payload: &[u8]) {
        let (user_id, is_async) = decode_message_id(_message_id);

        if is_async {
            self.deliver_async(user_id, message_type, payload);
        } else {
            self.deliver_sync(user_id, message_type, payload);
        }
    }

    fn decode(&self, message_type: u32, payload: &[u8]) -> Result<H::Response> {
        if message_type == ERROR_MESSAGE_TYPE {
            if payload.len() < 8 {
                return Err(Error::InvalidArgument("short error envelope".into()));
            }
            let code = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            return Err(Error::application(code));
        }
        if message_type != H::MESSAGE_TYPE {
            return Err(Error::WrongType {
                expected: H::MESSAGE_TYPE,
                got: message_type,
            });
        }
        self.handler
            .process_response(payload)
            .map_err(Into::into)
    }

    fn deliver_sync(&self, user_id: u32, message_type: u32, payload: &[u8]) {
        loop {
            let head = {
                let mut table = self.sync_table.lock().unwrap();
                table.pop_front()
            };
            let Some(entry) = head else { return };

            if entry.user_id != user_id {
                self.sync_pending.fetch_sub(1, Ordering::AcqRel);
                entry.response.complete_err(Error::NoResponse);
                self.gate.notify_all();
                continue;
            }

            self.sync_pending.fetch_sub(1, Ordering::AcqRel);
            match self.decode(message_type, payload) {
                Ok(value) => entry.response.complete_ok(value),
                Err(e) => entry.response.complete_err(e),
            }
            self.gate.notify_all();
            return;
        }
    }

    fn deliver_async(&self, user_id: u32, message_type: u32, payload: &[u8]) {
        let response = self.async_table.lock().unwrap().shift_remove(&user_id);
        let Some(response) = response else { return };
        match self.decode(message_type, payload) {
            Ok(value) => response.complete_ok(value),
            Err(e) => response.complete_err(e),
        }
    }

    /// Drains both tables, aborting every pending response with
    /// `connection_aborted` and waking all waiting fibers exactly once.
    pub fn on_teardown(&self) {
        let sync_entries: Vec<_> = self.sync_table.lock().unwrap().drain(..).collect();
        self.sync_pending.store(0, Ordering::Release);
        for entry in sync_entries {
            entry.response.complete_err(Error::ConnectionAborted);
        }

        let async_entries: Vec<_> = self
            .async_table
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, v)| v)
            .collect();
        for response in async_entries {
            response.complete_err(Error::ConnectionAborted);
        }

        self.gate.notify_all();
    }

    /// Next free async user id, for callers that don't mint their own.
    pub fn next_user_id(&self) -> u32 {
        self.next_user_id.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF
    }
}
