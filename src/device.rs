//! External collaborator seam (spec §1/§6): device enumeration and
//! memory-region registration are a fixed contract this crate consumes but
//! does not reimplement. `MemoryRegionManager` and `DeviceContext` declare
//! that contract as traits so [`crate::buffer`]/[`crate::completion`] have
//! something concrete to compile and test against.
//!
//! This module also carries the real `rdma-sys` adapters for the seams
//! declared elsewhere ([`crate::cm::CmEventSource`], [`crate::completion::CompletionSource`])
//! plus [`QueuePair`]'s send/receive posting, grounded in the same verbs
//! calls `InfinibandService::run` and a real verbs-based queue pair
//! implementation make: `rdma_get_cm_event`, `ibv_poll_cq`, `ibv_post_send`,
//! `ibv_post_recv`.

use std::collections::HashMap;
use std::io;
use std::ops;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::cm::{CmEventSource, RawCmEvent};
use crate::completion::CompletionSource;
use crate::connection::{CmEventKind, ConnectionId};
use crate::error::{Error, Result};
use crate::verbs::Wc;

/// Access flags passed to `ibv_reg_mr`; named subset actually used by this
/// crate's send/receive buffers. Hand-rolled the same way `epoll::Ready`
/// and `epoll::EpollOpt` are, rather than pulling in a flags crate for
/// three bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(0b001);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(0b010);
    pub const REMOTE_READ: AccessFlags = AccessFlags(0b100);

    pub fn empty() -> AccessFlags {
        AccessFlags(0)
    }

    pub fn contains(self, other: AccessFlags) -> bool {
        (self & other) == other
    }
}

impl ops::BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, other: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | other.0)
    }
}

impl ops::BitAnd for AccessFlags {
    type Output = AccessFlags;

    fn bitand(self, other: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 & other.0)
    }
}

/// A registered chunk of memory: a local pointer/length pair plus the local
/// key (`lkey`) verbs needs on a work request's scatter/gather entry.
#[derive(Clone, Copy)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
    lkey: u32,
}

unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    pub fn from_raw(ptr: NonNull<u8>, len: usize, lkey: u32) -> MemoryRegion {
        MemoryRegion { ptr, len, lkey }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }
}

/// Registers externally- or internally-owned memory against a protection
/// domain. Spec §6's "Memory-region manager" external collaborator.
pub trait MemoryRegionManager: Send + Sync {
    /// Registers an existing allocation.
    fn register(&self, ptr: NonNull<u8>, len: usize, access: AccessFlags) -> Result<MemoryRegion>;

    /// Allocates and registers a new, crate-owned region.
    fn allocate(&self, len: usize, access: AccessFlags) -> Result<MemoryRegion>;
}

/// The enumerated RDMA device this service runs against. Spec §9 open
/// question (ii): the original hard-requires exactly one device; this
/// crate keeps that restriction rather than silently assuming it.
///
/// TODO: revisit once multi-device support is in scope (spec §9(ii), §1
/// Non-goals).
pub trait DeviceContext: Send + Sync {
    fn memory_region_manager(&self) -> &dyn MemoryRegionManager;

    /// Local identifier of the enumerated device's port, surfaced purely
    /// for logging/diagnostics.
    fn port_guid(&self) -> u64;
}

/// Thin in-process `MemoryRegionManager` for tests and for callers who
/// register memory themselves and just need the trait object plumbing.
/// Registration is a no-op cast: callers are expected to have already
/// pinned and registered the memory through their own verbs context.
pub struct PassthroughMemoryRegionManager;

impl MemoryRegionManager for PassthroughMemoryRegionManager {
    fn register(&self, ptr: NonNull<u8>, len: usize, _access: AccessFlags) -> Result<MemoryRegion> {
        Ok(MemoryRegion::from_raw(ptr, len, 0))
    }

    fn allocate(&self, len: usize, access: AccessFlags) -> Result<MemoryRegion> {
        let layout = std::alloc::Layout::from_size_align(len, 8)
            .map_err(|e| crate::error::Error::InvalidArgument(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(crate::error::Error::OutOfBuffers)?;
        self.register(ptr, len, access)
    }
}

/// Posts work requests on one connection's queue pair. Creating, modifying
/// and destroying the underlying `ibv_qp` as the CM FSM advances is the
/// device/CM collaborator's job (spec §5's external collaborators); this
/// trait is only the posting surface [`crate::connection::Connection`] and
/// [`crate::message::MessageSocket`] need once a queue pair is attached.
pub trait QueuePair: Send + Sync {
    fn post_send(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()>;

    fn post_recv(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()>;
}

/// `ibv_post_send`/`ibv_post_recv` opcode and flag values from `verbs.h`'s
/// `ibv_wr_opcode`/`ibv_send_flags` enums, kept as local constants for the
/// same reason `verbs.rs`'s `IBV_WC_SUCCESS` is: the generated binding's
/// constant names vary across `rdma-core` versions, but these integer
/// values are part of the stable kernel/userspace ABI.
const IBV_WR_SEND: u32 = 2;
const IBV_SEND_SIGNALED: u32 = 1 << 1;

/// A queue pair backed by a real, already-connected `ibv_qp`.
pub struct RdmaQueuePair {
    qp: NonNull<rdma_sys::ibv_qp>,
}

unsafe impl Send for RdmaQueuePair {}
unsafe impl Sync for RdmaQueuePair {}

impl RdmaQueuePair {
    /// # Safety
    /// `qp` must point to a live `ibv_qp` that outlives this handle and is
    /// not concurrently posted to from anywhere else (verbs queue pairs are
    /// not safe to post to concurrently from multiple threads).
    pub unsafe fn from_raw(qp: NonNull<rdma_sys::ibv_qp>) -> RdmaQueuePair {
        RdmaQueuePair { qp }
    }
}

/// Translates a post's return value the way `ibv_post_send`/`ibv_post_recv`
/// report failure: a nonzero return is the `errno` value directly, not
/// `-1`-with-`errno`-set.
fn post_result(ret: i32) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Connection(io::Error::from_raw_os_error(ret)))
    }
}

impl QueuePair for RdmaQueuePair {
    fn post_send(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()> {
        let mut sge = rdma_sys::ibv_sge {
            addr,
            length: len,
            lkey,
        };
        let mut wr: rdma_sys::ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = IBV_WR_SEND;
        wr.send_flags = IBV_SEND_SIGNALED;

        let mut bad_wr: *mut rdma_sys::ibv_send_wr = std::ptr::null_mut();
        let ret = unsafe { rdma_sys::ibv_post_send(self.qp.as_ptr(), &mut wr, &mut bad_wr) };
        post_result(ret)
    }

    fn post_recv(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> Result<()> {
        let mut sge = rdma_sys::ibv_sge {
            addr,
            length: len,
            lkey,
        };
        let mut wr: rdma_sys::ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut rdma_sys::ibv_recv_wr = std::ptr::null_mut();
        let ret = unsafe { rdma_sys::ibv_post_recv(self.qp.as_ptr(), &mut wr, &mut bad_wr) };
        post_result(ret)
    }
}

/// `rdma_cm_event_type` values (`rdma_cma.h`), local for the same reason as
/// [`IBV_WR_SEND`] above.
const RDMA_CM_EVENT_ADDR_RESOLVED: u32 = 0;
const RDMA_CM_EVENT_ADDR_ERROR: u32 = 1;
const RDMA_CM_EVENT_ROUTE_RESOLVED: u32 = 2;
const RDMA_CM_EVENT_ROUTE_ERROR: u32 = 3;
const RDMA_CM_EVENT_CONNECT_REQUEST: u32 = 4;
const RDMA_CM_EVENT_CONNECT_ERROR: u32 = 6;
const RDMA_CM_EVENT_UNREACHABLE: u32 = 7;
const RDMA_CM_EVENT_REJECTED: u32 = 8;
const RDMA_CM_EVENT_ESTABLISHED: u32 = 9;
const RDMA_CM_EVENT_DISCONNECTED: u32 = 10;
const RDMA_CM_EVENT_TIMEWAIT_EXIT: u32 = 15;

fn cm_event_kind(raw: u32) -> Option<CmEventKind> {
    Some(match raw {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        _ => return None,
    })
}

/// Real CM event source, grounded in `InfinibandService::run`'s
/// `rdma_get_cm_event`/`rdma_ack_cm_event` loop. `rdma_create_id`/
/// `rdma_connect`/`rdma_accept` are called by the device/CM collaborator,
/// not this crate (spec §5); [`RdmaCmEventSource::register_id`] is the hook
/// that collaborator uses to tell this source which [`ConnectionId`] a given
/// `rdma_cm_id` belongs to, so events read back off it can be routed.
pub struct RdmaCmEventSource {
    channel: NonNull<rdma_sys::rdma_event_channel>,
    ids: Mutex<HashMap<usize, ConnectionId>>,
}

unsafe impl Send for RdmaCmEventSource {}

impl RdmaCmEventSource {
    pub fn new() -> Result<RdmaCmEventSource> {
        let channel = unsafe { rdma_sys::rdma_create_event_channel() };
        let channel = NonNull::new(channel)
            .ok_or_else(|| Error::Connection(io::Error::last_os_error()))?;
        Ok(RdmaCmEventSource {
            channel,
            ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_id(&self, id: *mut rdma_sys::rdma_cm_id, connection_id: ConnectionId) {
        self.ids.lock().unwrap().insert(id as usize, connection_id);
    }

    pub fn forget_id(&self, id: *mut rdma_sys::rdma_cm_id) {
        self.ids.lock().unwrap().remove(&(id as usize));
    }
}

impl Drop for RdmaCmEventSource {
    fn drop(&mut self) {
        unsafe { rdma_sys::rdma_destroy_event_channel(self.channel.as_ptr()) };
    }
}

impl CmEventSource for RdmaCmEventSource {
    fn get_event(&mut self) -> io::Result<Option<RawCmEvent>> {
        let mut event: *mut rdma_sys::rdma_cm_event = std::ptr::null_mut();
        let ret = unsafe { rdma_sys::rdma_get_cm_event(self.channel.as_ptr(), &mut event) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(None)
            } else {
                Err(err)
            };
        }

        let raw = unsafe { &*event };
        let kind = cm_event_kind(raw.event as u32);
        let (private_data_ptr, private_data_len) =
            unsafe { (raw.param.conn.private_data, raw.param.conn.private_data_len) };
        let private_data = if private_data_ptr.is_null() || private_data_len == 0 {
            Vec::new()
        } else {
            unsafe {
                std::slice::from_raw_parts(private_data_ptr as *const u8, private_data_len as usize)
            }
            .to_vec()
        };
        let connection_id = self.ids.lock().unwrap().get(&(raw.id as usize)).copied();

        let ack = unsafe { rdma_sys::rdma_ack_cm_event(event) };
        if ack != 0 {
            return Err(io::Error::last_os_error());
        }

        let (Some(kind), Some(connection_id)) = (kind, connection_id) else {
            // Either an event type this crate's FSM doesn't model (e.g.
            // multicast join/error) or an id this source was never told
            // about: nothing to route, but not an error either.
            return Ok(None);
        };

        Ok(Some(RawCmEvent {
            connection_id,
            kind,
            private_data,
        }))
    }
}

/// Real completion source, grounded in `ibv_poll_cq`/`ibv_req_notify_cq`/
/// `ibv_get_cq_event` plus `ibv_ack_cq_events`. `ibv_create_cq`/
/// `ibv_create_comp_channel` are called by the device collaborator that
/// builds this; this source only drains and re-arms it.
pub struct RdmaCompletionSource {
    cq: NonNull<rdma_sys::ibv_cq>,
    channel: NonNull<rdma_sys::ibv_comp_channel>,
}

unsafe impl Send for RdmaCompletionSource {}
unsafe impl Sync for RdmaCompletionSource {}

impl RdmaCompletionSource {
    /// # Safety
    /// `cq` must have been created against `channel`, and both must outlive
    /// this source.
    pub unsafe fn from_raw(
        cq: NonNull<rdma_sys::ibv_cq>,
        channel: NonNull<rdma_sys::ibv_comp_channel>,
    ) -> RdmaCompletionSource {
        RdmaCompletionSource { cq, channel }
    }
}

impl CompletionSource for RdmaCompletionSource {
    fn fd(&self) -> std::os::unix::io::RawFd {
        unsafe { (*self.channel.as_ptr()).fd }
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let num = unsafe {
            rdma_sys::ibv_poll_cq(self.cq.as_ptr(), wc.len() as i32, wc.as_mut_ptr().cast())
        };
        if num < 0 {
            Err(io::Error::from_raw_os_error(num))
        } else {
            Ok(num as usize)
        }
    }

    fn request_notify(&self) -> io::Result<()> {
        let ret = unsafe { rdma_sys::ibv_req_notify_cq(self.cq.as_ptr(), 0) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(ret))
        }
    }

    fn ack_event(&self) -> io::Result<()> {
        let mut cq_ptr: *mut rdma_sys::ibv_cq = std::ptr::null_mut();
        let mut cq_context: *mut std::ffi::c_void = std::ptr::null_mut();
        let ret = unsafe {
            rdma_sys::ibv_get_cq_event(self.channel.as_ptr(), &mut cq_ptr, &mut cq_context)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { rdma_sys::ibv_ack_cq_events(cq_ptr, 1) };
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn passthrough_allocate_roundtrips_length() {
        let mgr = PassthroughMemoryRegionManager;
        let region = mgr.allocate(256, AccessFlags::LOCAL_WRITE).unwrap();
        assert_eq!(region.len(), 256);
    }
}
