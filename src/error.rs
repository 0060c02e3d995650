//! Error taxonomy shared across the transport core (spec §7).
//!
//! CM and completion errors translate into this enum and are delivered via
//! handler callbacks or by aborting pending RPC responses. `wrong_type` and
//! `no_response` complete an individual response without tearing down the
//! connection. System-call failures during CM/epoll setup are fatal and are
//! not represented here — they terminate the process (see [`crate::cm`]).

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("address resolution failed: {0}")]
    AddressResolution(#[source] io::Error),

    #[error("route resolution failed: {0}")]
    RouteResolution(#[source] io::Error),

    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("destination unreachable")]
    Unreachable,

    #[error("connection rejected")]
    ConnectionRejected { private_data: Vec<u8> },

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("response carried unexpected message type {got}, expected {expected}")]
    WrongType { expected: u32, got: u32 },

    #[error("sync response did not match the FIFO head")]
    NoResponse,

    #[error("buffer pool exhausted")]
    OutOfBuffers,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("application error {code}")]
    Application { code: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn application(code: u64) -> Error {
        Error::Application { code }
    }

    /// True for errors that complete an individual RPC response without
    /// invalidating the connection (spec §7 propagation policy).
    pub fn is_protocol_local(&self) -> bool {
        matches!(self, Error::WrongType { .. } | Error::NoResponse | Error::Application { .. })
    }
}

/// Programmer errors called out in spec §7: these are asserted, never
/// returned as a `Result`, because there is no caller that could recover
/// from them sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammerError {
    ResultAlreadyRetrieved,
    PromiseAlreadySatisfied,
    TaskQueueSelfEnqueueWhileFull,
}

impl fmt::Display for ProgrammerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ProgrammerError::ResultAlreadyRetrieved => "result_already_retrieved",
            ProgrammerError::PromiseAlreadySatisfied => "promise_already_satisfied",
            ProgrammerError::TaskQueueSelfEnqueueWhileFull => {
                "task queue producer is its own consumer thread and the queue is full"
            }
        };
        f.write_str(msg)
    }
}

impl ProgrammerError {
    #[track_caller]
    pub fn panic(self) -> ! {
        panic!("{}", self)
    }
}
