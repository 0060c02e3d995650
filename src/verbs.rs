//! Thin seam over raw `ibv_wc` completions and the work-request id encoding
//! used to route a completion back to the connection and buffer it belongs
//! to (spec §4.3). Queue-pair and memory-region lifecycle live outside this
//! crate (spec §5's external collaborators) — this module only decodes what
//! the completion queue hands back.

use std::fmt;

use thiserror::Error;

use crate::error::Error;

/// `libibverbs`' `IBV_WC_SUCCESS`; kept as a local constant rather than
/// pulled from `rdma_sys` because the generated binding's exact path varies
/// across `rdma-core` versions.
const IBV_WC_SUCCESS: u32 = 0;

/// Whether a work request posted a send or a receive; encoded into the
/// low bit of a [`WorkRequestId`] so the completion handler can dispatch
/// without consulting the queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOp {
    Send,
    Recv,
}

/// A `wr_id` carrying the connection and buffer it was posted for, so a
/// completion can be routed back without a side table.
///
/// Layout: `[ connection_id: 32 | buffer_id: 31 | op: 1 ]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequestId(u64);

const OP_BIT: u64 = 1;
const BUFFER_SHIFT: u32 = 1;
const BUFFER_MASK: u64 = 0x7FFF_FFFF;
const CONN_SHIFT: u32 = 32;

impl WorkRequestId {
    pub fn encode(connection_id: u32, buffer_id: u32, op: WrOp) -> WorkRequestId {
        assert!(
            buffer_id as u64 <= BUFFER_MASK,
            "buffer id does not fit in 31 bits"
        );
        let op_bit = match op {
            WrOp::Send => 0,
            WrOp::Recv => 1,
        };
        let raw = ((connection_id as u64) << CONN_SHIFT)
            | ((buffer_id as u64) << BUFFER_SHIFT)
            | op_bit;
        WorkRequestId(raw)
    }

    pub fn decode(self) -> (u32, u32, WrOp) {
        let connection_id = (self.0 >> CONN_SHIFT) as u32;
        let buffer_id = ((self.0 >> BUFFER_SHIFT) & BUFFER_MASK) as u32;
        let op = if self.0 & OP_BIT == 0 {
            WrOp::Send
        } else {
            WrOp::Recv
        };
        (connection_id, buffer_id, op)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for WorkRequestId {
    fn from(raw: u64) -> WorkRequestId {
        WorkRequestId(raw)
    }
}

/// Completion status of a work request, mirrored from `ibv_wc_status`.
/// Only the statuses the transport needs to distinguish are named;
/// everything else collapses into [`WcStatus::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,
    #[error("work request flushed")]
    WrFlushErr,
    #[error("local length error")]
    LocLenErr,
    #[error("local protection error")]
    LocProtErr,
    #[error("retry counter exceeded")]
    RetryExcErr,
    #[error("remote access error")]
    RemAccessErr,
    #[error("completion status {0}")]
    Other(u32),
}

impl From<u32> for WcStatus {
    fn from(raw: u32) -> WcStatus {
        match raw {
            0 => WcStatus::Success,
            5 => WcStatus::WrFlushErr,
            1 => WcStatus::LocLenErr,
            4 => WcStatus::LocProtErr,
            12 => WcStatus::RetryExcErr,
            10 => WcStatus::RemAccessErr,
            other => WcStatus::Other(other),
        }
    }
}

/// Work completion entry. Transparently wraps `rdma_sys::ibv_wc`.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Wc(pub rdma_sys::ibv_wc);

unsafe impl Send for Wc {}

impl Wc {
    pub fn wr_id(&self) -> WorkRequestId {
        WorkRequestId(self.0.wr_id)
    }

    pub fn status(&self) -> WcStatus {
        WcStatus::from(self.0.status)
    }

    pub fn bytes(&self) -> usize {
        self.0.byte_len as usize
    }

    pub fn is_ok(&self) -> bool {
        self.0.status == IBV_WC_SUCCESS
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Translates a work completion's status into the crate's error taxonomy,
/// used when a send/receive fails outside of connection teardown.
pub fn wc_to_result(wc: &Wc) -> Result<usize, Error> {
    if wc.is_ok() {
        return Ok(wc.bytes());
    }
    match wc.status() {
        WcStatus::WrFlushErr => Err(Error::ConnectionAborted),
        other => Err(Error::Connection(std::io::Error::other(other.to_string()))),
    }
}
