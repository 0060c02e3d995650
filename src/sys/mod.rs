//! Raw OS-level plumbing: the epoll syscalls, eventfd, and a thin file
//! descriptor wrapper. Everything above this module talks to these through
//! the `epoll` module's `Epoll`/`Source`/`Token` types, never directly.

pub(crate) mod epoll;
pub(crate) mod eventfd;
mod fd;

pub(crate) use fd::FileDesc;

/// Retries a syscall expression on `EINTR`, matching the `syscall!` helper
/// the teacher crate uses throughout `sys::epoll`.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;
