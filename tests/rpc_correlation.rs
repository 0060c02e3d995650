use std::sync::{Arc, Mutex};

use qpio::buffer::BufferView;
use qpio::completion::CompletionContext;
use qpio::connection::{CmEventKind, Connection, ConnectionHandler};
use qpio::device::QueuePair;
use qpio::error::{Error, Result};
use qpio::fiber::Fiber;
use qpio::message::MessageSocket;
use qpio::reactor::EventProcessor;
use qpio::rpc::{encode_message_id, RpcClientSocket, RpcHandler, ERROR_MESSAGE_TYPE};

struct NullHandler;

impl ConnectionHandler for NullHandler {
    fn on_connected(&self, _result: Result<()>) {}
    fn on_receive(&self, _buf: &BufferView<'_>, _len: usize, _result: Result<()>) {}
    fn on_send(&self, _buf: &BufferView<'_>, _len: usize, _result: Result<()>) {}
}

struct RecordingQueuePair {
    posted: Mutex<Vec<u64>>,
}

impl QueuePair for RecordingQueuePair {
    fn post_send(&self, wr_id: u64, _addr: u64, _len: u32, _lkey: u32) -> Result<()> {
        self.posted.lock().unwrap().push(wr_id);
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, _addr: u64, _len: u32, _lkey: u32) -> Result<()> {
        self.posted.lock().unwrap().push(wr_id);
        Ok(())
    }
}

struct EchoHandler;

impl RpcHandler for EchoHandler {
    type Response = Vec<u8>;
    type Error = Error;

    const MESSAGE_TYPE: u32 = 7;

    fn process_response(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

fn connected_rpc_socket(max_pending: usize) -> RpcClientSocket<EchoHandler> {
    let processor = Arc::new(EventProcessor::new(10).unwrap());
    let completion = Arc::new(CompletionContext::new(
        qpio::buffer::BufferPool::new(4096),
        qpio::buffer::BufferPool::new(4096),
    ));
    let connection = Connection::open(&processor, &completion, Arc::new(NullHandler)).unwrap();
    connection.connect(&"127.0.0.1:4791".parse().unwrap()).unwrap();
    connection.on_cm_event(CmEventKind::AddrResolved, &[]);
    connection.on_cm_event(CmEventKind::RouteResolved, &[]);
    connection.on_cm_event(CmEventKind::Established, &[]);
    connection.attach_queue_pair(Arc::new(RecordingQueuePair {
        posted: Mutex::new(Vec::new()),
    }));
    let socket = Arc::new(MessageSocket::new(connection, 4096));
    RpcClientSocket::new(socket, EchoHandler, max_pending)
}

#[test]
fn sync_call_delivers_matching_reply_in_fifo_order() {
    let processor = Arc::new(EventProcessor::new(10).unwrap());
    let rpc = connected_rpc_socket(4);
    let fiber = Fiber::execute(&processor, || {});

    let first = rpc.call_sync(&fiber, b"one");
    let second = rpc.call_sync(&fiber, b"two");

    // Replies arrive in the order requests were sent, matching the FIFO
    // correlation table (ids 0 and 1 respectively).
    rpc.on_message(encode_message_id(0, false), 7, b"reply-one");
    rpc.on_message(encode_message_id(1, false), 7, b"reply-two");

    assert_eq!(first.get().unwrap(), b"reply-one");
    assert_eq!(second.get().unwrap(), b"reply-two");
}

#[test]
fn async_call_is_delivered_by_key_regardless_of_arrival_order() {
    let processor = Arc::new(EventProcessor::new(10).unwrap());
    let rpc = connected_rpc_socket(4);
    let fiber = Fiber::execute(&processor, || {});

    let id_a = rpc.next_user_id();
    let id_b = rpc.next_user_id();
    let a = rpc.call_async(&fiber, id_a, b"a");
    let b = rpc.call_async(&fiber, id_b, b"b");

    // Reply for the second request arrives first; keyed lookup must still
    // route it to the right handle.
    rpc.on_message(encode_message_id(id_b, true), 7, b"reply-b");
    rpc.on_message(encode_message_id(id_a, true), 7, b"reply-a");

    assert_eq!(a.get().unwrap(), b"reply-a");
    assert_eq!(b.get().unwrap(), b"reply-b");
}

#[test]
fn server_error_envelope_surfaces_as_application_error() {
    let processor = Arc::new(EventProcessor::new(10).unwrap());
    let rpc = connected_rpc_socket(4);
    let fiber = Fiber::execute(&processor, || {});

    let response = rpc.call_sync(&fiber, b"will-fail");
    rpc.on_message(encode_message_id(0, false), ERROR_MESSAGE_TYPE, &404u64.to_le_bytes());

    match response.get() {
        Err(Error::Application { code }) => assert_eq!(code, 404),
        other => panic!("expected an application error, got {:?}", other),
    }
}

#[test]
fn teardown_aborts_every_pending_response() {
    let processor = Arc::new(EventProcessor::new(10).unwrap());
    let rpc = connected_rpc_socket(4);
    let fiber = Fiber::execute(&processor, || {});

    let sync = rpc.call_sync(&fiber, b"pending");
    let user_id = rpc.next_user_id();
    let async_resp = rpc.call_async(&fiber, user_id, b"pending");

    rpc.on_teardown();

    assert!(matches!(sync.get(), Err(Error::ConnectionAborted)));
    assert!(matches!(async_resp.get(), Err(Error::ConnectionAborted)));
}
