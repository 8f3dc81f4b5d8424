//! Fiber stacks.
//!
//! A stack is a page-rounded anonymous mapping with one inaccessible guard
//! page below the usable range, so a runaway fiber faults instead of
//! silently scribbling over a neighbouring allocation:
//!
//! ```text
//! top    +--------------------+   <- initial stack pointer (16-aligned)
//!        |  usable stack      |
//! base+P +--------------------+
//!        |  guard page        |   PROT_NONE
//! base   +--------------------+
//! ```

use std::io;
use std::ptr;

pub(crate) struct Stack {
    base: *mut u8,
    /// Full mapping length, guard page included.
    len: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl Stack {
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = if size == 0 {
            page
        } else {
            (size + page - 1) & !(page - 1)
        };
        let len = size + page;
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let base = base.cast::<u8>();
            if libc::mprotect(
                base.add(page).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(base.cast(), len);
                return Err(err);
            }
            Ok(Self { base, len })
        }
    }

    /// One past the highest usable byte; where execution starts.
    #[inline(always)]
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.cast(), self.len) };
        debug_assert_eq!(rc, 0);
    }
}
