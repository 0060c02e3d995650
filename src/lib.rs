//! `qpio` is an asynchronous InfiniBand/RDMA transport core: a single-threaded
//! busy-polling event loop, a connection-manager-driven connection state
//! machine with zero-copy send/receive buffers, and a fiber-based RPC client
//! socket that lets request/response code read as straight-line calls over
//! an asynchronous fabric.
//!
//! The crate is organized leaf-first, the way a small `epoll` wrapper is
//! organized: [`sys`] holds the raw syscalls, [`epoll`] wraps them in a safe
//! selector, and each spec component gets its own module built on top.
//!
//! # Example
//!
//! ```no_run
//! use qpio::config::Config;
//! use qpio::reactor::EventProcessor;
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let processor = Arc::new(EventProcessor::new(config.poll_cycles).unwrap());
//! let _handle = EventProcessor::spawn(processor.clone());
//! ```

extern crate libc;
#[macro_use]
extern crate log;

mod sys;

pub mod epoll;
mod waker;
mod queue;

pub mod buffer;
pub mod cm;
pub mod completion;
pub mod config;
pub mod connection;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod fiber;
pub mod message;
pub mod reactor;
pub mod rpc;
pub mod service;
pub mod task_queue;
pub mod verbs;

pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use reactor::{EventProcessor, Poller};
pub use service::Service;
