//! Thin wrappers around the syscalls the crate relies on.
//!
//! Every function maps a `-1` return to a [`NativeError`] carrying the
//! operation name and the errno captured through
//! [`std::io::Error::last_os_error`]. No call in here retries or interprets
//! results beyond that; policy lives with the callers.

use std::mem::{size_of, MaybeUninit};
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, epoll_event, sockaddr, sockaddr_can, socklen_t};
use nix::net::if_::if_nametoindex;

use crate::error::{Error, NativeError};

pub(crate) fn socket(protocol: c_int) -> Result<RawFd, NativeError> {
    let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_DGRAM, protocol) };
    if fd == -1 {
        return Err(NativeError::last("socket"));
    }
    Ok(fd)
}

pub(crate) fn socket_raw() -> Result<RawFd, NativeError> {
    let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
    if fd == -1 {
        return Err(NativeError::last("socket"));
    }
    Ok(fd)
}

pub(crate) fn bind(fd: RawFd, addr: &sockaddr_can) -> Result<(), NativeError> {
    let rv = unsafe {
        libc::bind(
            fd,
            addr as *const sockaddr_can as *const sockaddr,
            size_of::<sockaddr_can>() as socklen_t,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("bind"));
    }
    Ok(())
}

pub(crate) fn connect(fd: RawFd, addr: &sockaddr_can) -> Result<(), NativeError> {
    let rv = unsafe {
        libc::connect(
            fd,
            addr as *const sockaddr_can as *const sockaddr,
            size_of::<sockaddr_can>() as socklen_t,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("connect"));
    }
    Ok(())
}

pub(crate) fn close(fd: RawFd) -> Result<(), NativeError> {
    let rv = unsafe { libc::close(fd) };
    if rv == -1 {
        return Err(NativeError::last("close"));
    }
    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, NativeError> {
    let rv = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if rv < 0 {
        return Err(NativeError::last("read"));
    }
    Ok(rv as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize, NativeError> {
    let rv = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if rv < 0 {
        return Err(NativeError::last("write"));
    }
    Ok(rv as usize)
}

/// Pass a `#[repr(C)]` option struct to the kernel.
pub(crate) fn setsockopt<T>(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: &T,
) -> Result<(), NativeError> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            size_of::<T>() as socklen_t,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("setsockopt"));
    }
    Ok(())
}

/// Pass a contiguous array of `#[repr(C)]` values to the kernel.
pub(crate) fn setsockopt_slice<T>(
    fd: RawFd,
    level: c_int,
    name: c_int,
    values: &[T],
) -> Result<(), NativeError> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            values.as_ptr() as *const c_void,
            (values.len() * size_of::<T>()) as socklen_t,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("setsockopt"));
    }
    Ok(())
}

pub(crate) fn getsockopt<T>(fd: RawFd, level: c_int, name: c_int) -> Result<T, NativeError> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut len = size_of::<T>() as socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            value.as_mut_ptr() as *mut c_void,
            &mut len,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("getsockopt"));
    }
    Ok(unsafe { value.assume_init() })
}

/// Read a kernel-sized array option; returns how many `T` the kernel wrote.
pub(crate) fn getsockopt_slice<T>(
    fd: RawFd,
    level: c_int,
    name: c_int,
    buf: &mut [T],
) -> Result<usize, NativeError> {
    let mut len = (buf.len() * size_of::<T>()) as socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            buf.as_mut_ptr() as *mut c_void,
            &mut len,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("getsockopt"));
    }
    Ok(len as usize / size_of::<T>())
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), NativeError> {
    let oldfl = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if oldfl == -1 {
        return Err(NativeError::last("fcntl"));
    }

    let newfl = if nonblocking {
        oldfl | libc::O_NONBLOCK
    } else {
        oldfl & !libc::O_NONBLOCK
    };

    let rv = unsafe { libc::fcntl(fd, libc::F_SETFL, newfl) };
    if rv == -1 {
        return Err(NativeError::last("fcntl"));
    }
    Ok(())
}

pub(crate) fn epoll_create() -> Result<RawFd, NativeError> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd == -1 {
        return Err(NativeError::last("epoll_create1"));
    }
    Ok(fd)
}

fn epoll_ctl(epfd: RawFd, op: c_int, fd: RawFd, events: u32) -> Result<(), NativeError> {
    let mut event = epoll_event {
        events,
        u64: fd as u64,
    };
    let event_ptr: *mut epoll_event = if op == libc::EPOLL_CTL_DEL {
        std::ptr::null_mut()
    } else {
        &mut event
    };
    let rv = unsafe { libc::epoll_ctl(epfd, op, fd, event_ptr) };
    if rv == -1 {
        return Err(NativeError::last("epoll_ctl"));
    }
    Ok(())
}

pub(crate) fn epoll_add(epfd: RawFd, fd: RawFd, events: u32) -> Result<(), NativeError> {
    epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, events)
}

pub(crate) fn epoll_mod(epfd: RawFd, fd: RawFd, events: u32) -> Result<(), NativeError> {
    epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, events)
}

pub(crate) fn epoll_del(epfd: RawFd, fd: RawFd) -> Result<(), NativeError> {
    epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, 0)
}

pub(crate) fn epoll_wait(
    epfd: RawFd,
    events: &mut [epoll_event],
    timeout_ms: c_int,
) -> Result<usize, NativeError> {
    let rv = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as c_int,
            timeout_ms,
        )
    };
    if rv == -1 {
        return Err(NativeError::last("epoll_wait"));
    }
    Ok(rv as usize)
}

pub(crate) fn eventfd() -> Result<RawFd, NativeError> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd == -1 {
        return Err(NativeError::last("eventfd"));
    }
    Ok(fd)
}

/// Latch the wakeup counter. Writes coalesce until the next clear.
pub(crate) fn eventfd_signal(fd: RawFd) -> Result<(), NativeError> {
    let value: u64 = 1;
    let rv = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const c_void,
            size_of::<u64>(),
        )
    };
    if rv < 0 {
        return Err(NativeError::last("eventfd write"));
    }
    Ok(())
}

/// Consume the wakeup counter. A concurrent reader having drained it already
/// is not an error; the fd is non-blocking for exactly that reason.
pub(crate) fn eventfd_clear(fd: RawFd) -> Result<(), NativeError> {
    let mut value: u64 = 0;
    let rv = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut c_void,
            size_of::<u64>(),
        )
    };
    if rv < 0 {
        let err = NativeError::last("eventfd read");
        if err.is_retryable() {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Resolve a CAN interface name such as "vcan0" to its kernel index.
pub(crate) fn if_index(ifname: &str) -> Result<c_int, Error> {
    let index = if_nametoindex(ifname)?;
    Ok(index as c_int)
}
