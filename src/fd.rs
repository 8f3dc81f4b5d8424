//! Per-descriptor bookkeeping for the hook layer.
//!
//! An [`FdCtx`] is created lazily the first time a hooked call touches a
//! descriptor. For sockets the kernel is switched to nonblocking mode
//! right away while the user's own blocking/nonblocking choice is only
//! recorded, so hooked calls can keep the blocking illusion and still
//! multiplex underneath.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::reactor::EventSet;

/// No timeout configured.
const NO_TIMEOUT: u64 = u64::MAX;

pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    closed: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    /// Milliseconds; `u64::MAX` means none.
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let mut is_socket = false;
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == 0 {
            let mode = unsafe { stat.assume_init() }.st_mode;
            is_socket = mode & libc::S_IFMT == libc::S_IFSOCK;
        }
        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }
        Self {
            fd,
            is_socket,
            closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    /// Timeout for the given direction: receive for READ, send for WRITE.
    pub fn timeout(&self, direction: EventSet) -> Option<u64> {
        let ms = if direction == EventSet::READ {
            self.recv_timeout.load(Ordering::Relaxed)
        } else {
            self.send_timeout.load(Ordering::Relaxed)
        };
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, direction: EventSet, ms: Option<u64>) {
        let ms = ms.unwrap_or(NO_TIMEOUT);
        if direction == EventSet::READ {
            self.recv_timeout.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout.store(ms, Ordering::Relaxed);
        }
    }
}

/// Process-wide table of per-fd contexts, indexed by descriptor number
/// and grown in 1.5x steps.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static TABLE: Lazy<FdTable> = Lazy::new(|| FdTable {
    slots: RwLock::new(vec![None; 64]),
});

/// The process-wide table.
pub fn fd_table() -> &'static FdTable {
    &TABLE
}

impl FdTable {
    /// Fetch the context of `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            match slots.get(index) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        let mut slots = self.slots.write().unwrap();
        if index >= slots.len() {
            slots.resize(index * 3 / 2 + 1, None);
        }
        if let Some(ctx) = &slots[index] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[index] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget the context of `fd` (called when the descriptor is closed).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}
