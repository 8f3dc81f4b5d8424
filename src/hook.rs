//! Redirected blocking calls.
//!
//! Each entry point here has the exact contract of its libc namesake,
//! except that, when the per-thread hook flag is on and the descriptor is
//! a socket the user still treats as blocking, a call that would block
//! instead registers readiness interest with the current [`Reactor`],
//! optionally arms a timeout timer, and yields the calling fiber. The
//! fiber resumes when the kernel reports readiness (or the timer cancels
//! the wait) and the call is retried, so blocking-looking code
//! transparently multiplexes.
//!
//! Everything falls through to the native libc call when the hook flag is
//! off, the fd is unknown, not a socket, or the user opted into
//! nonblocking mode themselves.
//!
//! The hook flag defaults to on inside scheduler workers and off
//! everywhere else.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::fd::{fd_table, FdCtx};
use crate::fiber::Fiber;
use crate::reactor::{EventSet, Reactor};
use crate::scheduler::Scheduler;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Is the hook active on this thread?
#[inline(always)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Toggle the hook for this thread.
#[inline(always)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|f| f.set(enabled));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(u64::MAX);

static TCP_CONNECT_TIMEOUT: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    let var = Config::lookup("tcp.connect.timeout", 5000u64, "tcp connect timeout in ms")
        .expect("tcp.connect.timeout registration cannot fail");
    CONNECT_TIMEOUT_MS.store(var.value(), Ordering::Relaxed);
    var.add_listener(|old, new| {
        log::info!("tcp connect timeout changed from {old} to {new}");
        CONNECT_TIMEOUT_MS.store(*new, Ordering::Relaxed);
    });
    var
});

#[inline]
fn cvt(rc: isize) -> io::Result<isize> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Shared between one blocked attempt and its timeout timer. The timer
/// only holds it weakly, so a late firing after the I/O completed finds
/// nothing to touch.
#[derive(Default)]
struct WaitToken {
    /// 0, or the errno the wait was cancelled with.
    cancelled: AtomicI32,
}

/// The generic retry loop shared by every data-path hook.
///
/// `native` is attempted first; on `EAGAIN` the fiber parks on `event`
/// readiness with the descriptor's timeout for that direction and retries
/// once resumed.
fn do_io(
    fd: RawFd,
    name: &str,
    event: EventSet,
    mut native: impl FnMut() -> isize,
) -> io::Result<isize> {
    if !is_hook_enabled() {
        return cvt(native());
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return cvt(native());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(native());
    }
    let timeout = ctx.timeout(event);

    loop {
        let mut rc = native();
        while rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            rc = native();
        }
        if rc != -1 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }

        // Would block: park on readiness.
        let Some(reactor) = Reactor::current() else {
            // No reactor on this thread; nothing can wake us.
            return Err(err);
        };
        let token = Arc::new(WaitToken::default());
        let timer = timeout.map(|ms| {
            let weak = Arc::downgrade(&token);
            let weak_reactor = Arc::downgrade(&reactor);
            reactor.add_condition_timer(
                ms,
                move || on_wait_timeout(&weak, &weak_reactor, fd, event),
                Arc::downgrade(&token) as Weak<dyn Any + Send + Sync>,
                false,
            )
        });
        if let Err(e) = reactor.add_event(fd, event, None) {
            log::error!("{name}: add_event({fd}, {event:?}) failed: {e}");
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
        }
        Fiber::yield_hold();
        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = token.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
        // Woken by readiness: retry the native call.
    }
}

fn on_wait_timeout(
    token: &Weak<WaitToken>,
    reactor: &Weak<Reactor>,
    fd: RawFd,
    event: EventSet,
) {
    let Some(token) = token.upgrade() else {
        return;
    };
    if token.cancelled.load(Ordering::SeqCst) != 0 {
        return;
    }
    token.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
    if let Some(reactor) = reactor.upgrade() {
        reactor.cancel_event(fd, event);
    }
}

////////////////////////////////////////////////////////////////////////////
// Sleep family
////////////////////////////////////////////////////////////////////////////

/// Suspend the calling fiber for `duration`; outside the runtime this is
/// a plain thread sleep.
pub fn sleep(duration: Duration) {
    if !is_hook_enabled() {
        return std::thread::sleep(duration);
    }
    let (Some(reactor), Some(fiber)) = (Reactor::current(), Fiber::current()) else {
        return std::thread::sleep(duration);
    };
    let sched = Scheduler::current().expect("a reactor thread always has a scheduler");
    reactor.add_timer(
        duration.as_millis() as u64,
        move || sched.submit_fiber(fiber.clone(), None),
        false,
    );
    Fiber::yield_hold();
}

/// `sleep` with a microsecond argument, rounded down to milliseconds.
pub fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros));
}

////////////////////////////////////////////////////////////////////////////
// Socket lifecycle
////////////////////////////////////////////////////////////////////////////

/// `socket(2)`; a per-fd context is created for the new descriptor.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty, protocol) } as isize)? as RawFd;
    if is_hook_enabled() {
        fd_table().get(fd, true);
    }
    Ok(fd)
}

/// `connect(2)` with the process-wide configured TCP connect timeout.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
    Lazy::force(&TCP_CONNECT_TIMEOUT);
    let ms = CONNECT_TIMEOUT_MS.load(Ordering::Relaxed);
    let timeout = (ms != u64::MAX).then_some(ms);
    connect_with_timeout(fd, addr, len, timeout)
}

/// `connect(2)`; on `EINPROGRESS` parks on WRITE readiness, optionally
/// bounded by `timeout_ms`, and reports the socket error on resume.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: Option<u64>,
) -> io::Result<()> {
    let native = || unsafe { libc::connect(fd, addr, len) as isize };
    if !is_hook_enabled() {
        return cvt(native()).map(drop);
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(native()).map(drop);
    }

    match cvt(native()) {
        Ok(_) => return Ok(()),
        Err(e) if e.raw_os_error() != Some(libc::EINPROGRESS) => return Err(e),
        Err(_) => {}
    }

    let Some(reactor) = Reactor::current() else {
        return Err(io::Error::from_raw_os_error(libc::EINPROGRESS));
    };
    let token = Arc::new(WaitToken::default());
    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&token);
        let weak_reactor = Arc::downgrade(&reactor);
        reactor.add_condition_timer(
            ms,
            move || on_wait_timeout(&weak, &weak_reactor, fd, EventSet::WRITE),
            Arc::downgrade(&token) as Weak<dyn Any + Send + Sync>,
            false,
        )
    });
    match reactor.add_event(fd, EventSet::WRITE, None) {
        Err(e) => {
            log::error!("connect: add_event({fd}, WRITE) failed: {e}");
            if let Some(timer) = &timer {
                timer.cancel();
            }
        }
        Ok(()) => {
            Fiber::yield_hold();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = token.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                return Err(io::Error::from_raw_os_error(cancelled));
            }
        }
    }

    // Either way report what the kernel thinks of the connection.
    let mut err: libc::c_int = 0;
    let mut err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut err_len,
        ) as isize
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// `accept(2)`; the accepted descriptor gets its own per-fd context.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let accepted = do_io(fd, "accept", EventSet::READ, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    })? as RawFd;
    if is_hook_enabled() {
        fd_table().get(accepted, true);
    }
    Ok(accepted)
}

/// `close(2)`; every armed event is cancelled first so parked fibers
/// resume and observe the closed descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_hook_enabled() {
        if fd_table().get(fd, false).is_some() {
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all(fd);
            }
            fd_table().del(fd);
        }
    }
    cvt(unsafe { libc::close(fd) as isize }).map(drop)
}

////////////////////////////////////////////////////////////////////////////
// Data path
////////////////////////////////////////////////////////////////////////////

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", EventSet::READ, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
    .map(|n| n as usize)
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", EventSet::READ, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr().cast(), bufs.len() as i32)
    })
    .map(|n| n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "recv", EventSet::READ, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
    .map(|n| n as usize)
}

/// `recvfrom(2)`; returns the byte count and the raw source address.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
) -> io::Result<(usize, libc::sockaddr_storage, libc::socklen_t)> {
    let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, "recvfrom", EventSet::READ, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            flags,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    })?;
    Ok((n as usize, storage, len))
}

/// `recvmsg(2)`.
///
/// # Safety
/// `msg` must point at a fully initialized message header whose iovec and
/// control buffers stay valid for the duration of the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, "recvmsg", EventSet::READ, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
    .map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", EventSet::WRITE, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
    .map(|n| n as usize)
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", EventSet::WRITE, || unsafe {
        libc::writev(fd, bufs.as_ptr().cast(), bufs.len() as i32)
    })
    .map(|n| n as usize)
}

/// `writev` over raw iovecs, for buffers that keep their own node chain.
pub fn writev_raw(fd: RawFd, iovs: &[libc::iovec]) -> io::Result<usize> {
    do_io(fd, "writev", EventSet::WRITE, || unsafe {
        libc::writev(fd, iovs.as_ptr(), iovs.len() as i32)
    })
    .map(|n| n as usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "send", EventSet::WRITE, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
    .map(|n| n as usize)
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> io::Result<usize> {
    do_io(fd, "sendto", EventSet::WRITE, || unsafe {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, addr, len)
    })
    .map(|n| n as usize)
}

/// `sendmsg(2)`.
///
/// # Safety
/// Same contract as [`recvmsg`].
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, "sendmsg", EventSet::WRITE, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
    .map(|n| n as usize)
}

////////////////////////////////////////////////////////////////////////////
// Descriptor options
////////////////////////////////////////////////////////////////////////////

/// `fcntl(F_GETFL)` reporting the *user's* blocking choice, not the
/// kernel nonblock the runtime forced.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<i32> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) } as isize)? as i32;
    let Some(ctx) = fd_table().get(fd, false) else {
        return Ok(flags);
    };
    if ctx.is_closed() || !ctx.is_socket() {
        return Ok(flags);
    }
    if ctx.user_nonblock() {
        Ok(flags | libc::O_NONBLOCK)
    } else {
        Ok(flags & !libc::O_NONBLOCK)
    }
}

/// `fcntl(F_SETFL)` recording the user's nonblock choice while keeping
/// the kernel-level nonblock the runtime relies on.
pub fn fcntl_setfl(fd: RawFd, mut flags: i32) -> io::Result<()> {
    if let Some(ctx) = fd_table().get(fd, false) {
        if !ctx.is_closed() && ctx.is_socket() {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
        }
    }
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } as isize).map(drop)
}

/// `ioctl(FIONBIO)`: the user's choice lands in the per-fd context; the
/// raw call always goes through.
pub fn ioctl_fionbio(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    if let Some(ctx) = fd_table().get(fd, false) {
        if !ctx.is_closed() && ctx.is_socket() {
            ctx.set_user_nonblock(nonblocking);
        }
    }
    let mut arg: libc::c_int = nonblocking as libc::c_int;
    cvt(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg) } as isize).map(drop)
}

fn set_timeout(fd: RawFd, direction: EventSet, optname: i32, timeout: Option<Duration>) -> io::Result<()> {
    if let Some(ctx) = fd_table().get(fd, false) {
        ctx.set_timeout(direction, timeout.map(|t| t.as_millis() as u64));
    }
    let tv = match timeout {
        Some(t) => libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        },
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            (&tv as *const libc::timeval).cast(),
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        ) as isize
    })
    .map(drop)
}

/// `setsockopt(SO_RCVTIMEO)`, also stored for the hook's READ waits.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, EventSet::READ, libc::SO_RCVTIMEO, timeout)
}

/// `setsockopt(SO_SNDTIMEO)`, also stored for the hook's WRITE waits.
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, EventSet::WRITE, libc::SO_SNDTIMEO, timeout)
}

/// Receive timeout as recorded in the per-fd context.
pub fn recv_timeout(fd: RawFd) -> Option<Duration> {
    fd_table()
        .get(fd, false)?
        .timeout(EventSet::READ)
        .map(Duration::from_millis)
}

/// Send timeout as recorded in the per-fd context.
pub fn send_timeout(fd: RawFd) -> Option<Duration> {
    fd_table()
        .get(fd, false)?
        .timeout(EventSet::WRITE)
        .map(Duration::from_millis)
}

/// Per-fd context of `fd`, if the hook layer knows the descriptor.
pub fn fd_context(fd: RawFd) -> Option<Arc<FdCtx>> {
    fd_table().get(fd, false)
}
