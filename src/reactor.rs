//! The I/O manager: a scheduler fused with epoll and the timer queue.
//!
//! A [`Reactor`] owns an edge-triggered epoll instance, a self-pipe for
//! wake-ups, a table of per-descriptor event contexts and a
//! [`TimerQueue`]. It attaches to the [`Scheduler`] it creates and
//! overrides the scheduler's extension points: `tickle` writes a byte to
//! the self-pipe when some worker is idle, the idle fiber blocks in
//! `epoll_wait` bounded by the next timer deadline, and the stopping
//! predicate additionally requires no armed events and no timers.
//!
//! Arming is per `(fd, direction)`: whoever registers interest leaves
//! either the current fiber or a callback in the descriptor's slot and
//! the idle loop submits it back to its scheduler when the kernel reports
//! readiness. `EPOLLERR`/`EPOLLHUP` are folded into whichever directions
//! are armed so the owner observes the failure through a normal wake-up.

use std::any::Any;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::scheduler::{current_tid, Scheduler, Task};
use crate::timer::{Timer, TimerCallback, TimerQueue};

bitflags! {
    /// Readiness directions; the bit values match epoll's.
    pub struct EventSet: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

const MAX_EVENTS: usize = 256;
/// Upper bound of one epoll wait, so shutdown and freshly armed timers
/// are noticed even without a tickle.
const MAX_TIMEOUT_MS: u64 = 3000;

#[inline]
fn cvt(t: libc::c_int) -> io::Result<libc::c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

enum WaiterJob {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// The continuation stored for one armed `(fd, direction)` pair.
struct Waiter {
    /// Scheduler to resume on.
    sched: Arc<Scheduler>,
    job: WaiterJob,
    /// Set for fiber waiters: the thread whose epoll registration the
    /// suspended fiber belongs to.
    thread: Option<u64>,
}

#[derive(Default)]
struct FdEvents {
    armed: EventSet,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl Default for EventSet {
    fn default() -> Self {
        EventSet::empty()
    }
}

impl FdEvents {
    fn slot(&mut self, event: EventSet) -> &mut Option<Waiter> {
        if event == EventSet::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Disarm `event` and submit its stored continuation.
    fn trigger(&mut self, fd: RawFd, event: EventSet) {
        debug_assert!(self.armed.contains(event));
        self.armed -= event;
        let Some(waiter) = self.slot(event).take() else {
            log::error!("fd={fd} fired {event:?} with no waiter");
            return;
        };
        match waiter.job {
            WaiterJob::Fiber(fiber) => waiter.sched.submit_fiber(fiber, waiter.thread),
            WaiterJob::Call(cb) => waiter.sched.submit_task(Task::call_boxed(cb)),
        }
    }
}

struct FdRecord {
    fd: RawFd,
    events: Mutex<FdEvents>,
}

impl FdRecord {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: Mutex::new(FdEvents::default()),
        }
    }
}

/// Scheduler + timer queue + readiness notifier.
pub struct Reactor {
    sched: Arc<Scheduler>,
    timers: Arc<TimerQueue>,
    epfd: RawFd,
    /// Self-pipe; the read end lives in the epoll set, level use only.
    tickle_fds: [RawFd; 2],
    records: RwLock<Vec<Arc<FdRecord>>>,
    /// Number of armed (fd, direction) pairs.
    pending: AtomicUsize,
}

/// The scheduler surface (submit, start, stop, ...) is reachable
/// directly on the reactor.
impl Deref for Reactor {
    type Target = Scheduler;

    #[inline(always)]
    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Reactor {
    /// Build the reactor, attach it to a fresh scheduler and start the
    /// workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Reactor>> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(e) = cvt(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }) {
            unsafe { libc::close(epfd) };
            return Err(e.into());
        }
        let setup = (|| -> io::Result<()> {
            let flags = cvt(unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) })?;
            cvt(unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLET) as u32,
                u64: pipe_fds[0] as u64,
            };
            cvt(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) })?;
            Ok(())
        })();
        if let Err(e) = setup {
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(e.into());
        }

        let sched = Scheduler::new(threads, use_caller, name);
        let timers = TimerQueue::new();
        let reactor = Arc::new(Reactor {
            sched: sched.clone(),
            timers: timers.clone(),
            epfd,
            tickle_fds: pipe_fds,
            records: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
        });
        reactor.grow_records(32);
        sched.attach_reactor(Arc::downgrade(&reactor));
        {
            let weak = Arc::downgrade(&reactor);
            timers.set_front_notify(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.tickle();
                }
            });
        }
        sched.start();
        Ok(reactor)
    }

    /// The reactor driving the calling thread, if any.
    pub fn current() -> Option<Arc<Reactor>> {
        Scheduler::current()?.reactor()
    }

    /// Armed (fd, direction) pairs; drops to zero before shutdown.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    ////////////////////////////////////////////////////////////////////////
    // Timers
    ////////////////////////////////////////////////////////////////////////

    /// Schedule `f` to run on this reactor after `interval_ms`, and every
    /// `interval_ms` after that when `recurring`.
    pub fn add_timer(
        &self,
        interval_ms: u64,
        f: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(interval_ms, Arc::new(f), recurring)
    }

    /// Like [`Self::add_timer`], but `f` only runs while `condition` can
    /// still be upgraded.
    pub fn add_condition_timer(
        &self,
        interval_ms: u64,
        f: impl Fn() + Send + Sync + 'static,
        condition: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer {
        self.timers
            .add_condition_timer(interval_ms, Arc::new(f), condition, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    ////////////////////////////////////////////////////////////////////////
    // Event table
    ////////////////////////////////////////////////////////////////////////

    fn grow_records(&self, len: usize) {
        let mut records = self.records.write().unwrap();
        let old = records.len();
        for fd in old..len {
            records.push(Arc::new(FdRecord::new(fd as RawFd)));
        }
    }

    fn record(&self, fd: RawFd) -> Arc<FdRecord> {
        let index = fd as usize;
        {
            let records = self.records.read().unwrap();
            if let Some(record) = records.get(index) {
                return record.clone();
            }
        }
        self.grow_records(index * 3 / 2 + 1);
        self.records.read().unwrap()[index].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdRecord>> {
        self.records.read().unwrap().get(fd as usize).cloned()
    }

    /// Register readiness interest. Without a callback the continuation
    /// is the calling fiber itself, pinned back to this thread.
    ///
    /// Arming the same direction twice on one descriptor is refused.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: EventSet,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        debug_assert!(
            event == EventSet::READ || event == EventSet::WRITE,
            "exactly one direction per registration"
        );
        let record = self.record(fd);
        let mut events = record.events.lock().unwrap();
        if events.armed.contains(event) {
            log::error!(
                "add_event: fd={fd} {event:?} already armed (armed={:?})",
                events.armed
            );
            return Err(Error::EventArmed(fd, event));
        }
        let op = if events.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | (events.armed | event).bits(),
            u64: fd as u64,
        };
        if let Err(e) = cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) }) {
            log::error!(
                "epoll_ctl({}, {op}, {fd}, {event:?}) failed: {e}, armed={:?}",
                self.epfd,
                events.armed
            );
            return Err(e.into());
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        events.armed |= event;

        let sched = Scheduler::current().unwrap_or_else(|| self.sched.clone());
        let waiter = match callback {
            Some(cb) => Waiter {
                sched,
                job: WaiterJob::Call(cb),
                thread: None,
            },
            None => {
                let fiber = Fiber::current()
                    .expect("add_event without a callback needs a current fiber");
                Waiter {
                    sched,
                    job: WaiterJob::Fiber(fiber),
                    thread: Some(current_tid()),
                }
            }
        };
        let slot = events.slot(event);
        debug_assert!(slot.is_none());
        *slot = Some(waiter);
        Ok(())
    }

    /// Remove an armed event without waking anyone.
    pub fn del_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(record) = self.lookup(fd) else {
            return false;
        };
        let mut events = record.events.lock().unwrap();
        if !events.armed.contains(event) {
            return false;
        }
        let remaining = events.armed - event;
        if !self.rearm(fd, remaining) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        events.armed = remaining;
        *events.slot(event) = None;
        true
    }

    /// Remove an armed event and immediately submit its continuation; the
    /// resumed owner observes whatever cancellation flag it agreed on.
    pub fn cancel_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(record) = self.lookup(fd) else {
            return false;
        };
        let mut events = record.events.lock().unwrap();
        if !events.armed.contains(event) {
            return false;
        }
        if !self.rearm(fd, events.armed - event) {
            return false;
        }
        events.trigger(record.fd, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Trigger every armed event of `fd` and drop it from the notifier.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(record) = self.lookup(fd) else {
            return false;
        };
        let mut events = record.events.lock().unwrap();
        if events.armed.is_empty() {
            return false;
        }
        if !self.rearm(fd, EventSet::empty()) {
            return false;
        }
        if events.armed.contains(EventSet::READ) {
            events.trigger(record.fd, EventSet::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if events.armed.contains(EventSet::WRITE) {
            events.trigger(record.fd, EventSet::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(events.armed.is_empty());
        true
    }

    /// Update the notifier registration of `fd` to exactly `remaining`.
    fn rearm(&self, fd: RawFd, remaining: EventSet) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: fd as u64,
        };
        match cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) }) {
            Ok(_) => true,
            Err(e) => {
                log::error!(
                    "epoll_ctl({}, {op}, {fd}, {remaining:?}) failed: {e}",
                    self.epfd
                );
                false
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Scheduler extension points
    ////////////////////////////////////////////////////////////////////////

    /// Force one worker out of its epoll wait. Skipped when every worker
    /// is busy: the queue is drained before the next wait anyway.
    pub(crate) fn tickle(&self) {
        if !self.sched.has_idlers() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr().cast(), 1) };
        debug_assert_eq!(rc, 1);
    }

    pub(crate) fn stopping(&self) -> bool {
        !self.timers.has_timer() && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// Body of every worker's idle fiber: wait for readiness or timer
    /// expiry, dispatch both, then yield so the worker can drain the
    /// ready queue.
    pub(crate) fn idle(&self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if self.stopping() {
                log::info!("{} idle exit", self.sched.name());
                break;
            }

            let timeout = self
                .timers
                .next_expiry()
                .unwrap_or(MAX_TIMEOUT_MS)
                .min(MAX_TIMEOUT_MS);
            let fired = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout as i32,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait({}) failed: {err}", self.epfd);
                break 0;
            };

            for ep in &events[..fired] {
                // epoll_event is packed; copy the fields out.
                let (ep_events, fd) = (ep.events, ep.u64 as RawFd);
                if fd == self.tickle_fds[0] {
                    let mut drain = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], drain.as_mut_ptr().cast(), drain.len())
                    } > 0
                    {}
                    continue;
                }
                let Some(record) = self.lookup(fd) else {
                    continue;
                };
                let mut slots = record.events.lock().unwrap();
                let mut ep_events = ep_events;
                if ep_events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Let the armed owner observe the failure.
                    ep_events |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & slots.armed.bits();
                }
                let real = EventSet::from_bits_truncate(ep_events) & slots.armed;
                if real.is_empty() {
                    continue;
                }
                if !self.rearm(fd, slots.armed - real) {
                    continue;
                }
                if real.contains(EventSet::READ) {
                    slots.trigger(record.fd, EventSet::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(EventSet::WRITE) {
                    slots.trigger(record.fd, EventSet::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            let expired = self.timers.collect_expired();
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb: TimerCallback| Task::call(move || cb()))
                    .collect();
                self.sched.submit_batch(tasks);
            }

            // Let the dispatch loop pick up what was just submitted.
            Fiber::yield_hold();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.sched.name())
            .field("pending", &self.pending_events())
            .finish_non_exhaustive()
    }
}
