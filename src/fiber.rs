//! Stackful coroutines.
//!
//! A fiber owns a preallocated stack and a saved machine context and is
//! resumed and suspended explicitly:
//! - [`Fiber::new`] creates a fiber around a closure,
//! - [`Fiber::resume`] runs it until it yields or finishes,
//! - [`Fiber::yield_hold`] / [`Fiber::yield_ready`] suspend the running
//!   fiber and return control to the thread's scheduling fiber.
//!
//! Every thread distinguishes two special fibers: the *main* fiber wraps
//! the thread's native stack and never owns one of its own, and the
//! *scheduling* fiber runs the scheduler's dispatch loop. On plain worker
//! threads they are one and the same; on a thread incorporated into a
//! scheduler with `use_caller` the scheduling fiber has its own stack and
//! is entered from the main fiber with [`Fiber::call`].
//!
//! At any instant at most one fiber per thread is executing; the
//! per-thread current-fiber pointer identifies it.

use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::error::Result;

mod stack;
mod switch;

use stack::Stack;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    Config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size in bytes")
        .expect("fiber.stack_size registration cannot fail")
});

/// Lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, never resumed since.
    Init = 0,
    /// Suspended, requeue wanted.
    Ready = 1,
    /// Currently running on some thread.
    Exec = 2,
    /// Suspended until something resumes it.
    Hold = 3,
    /// Entry returned.
    Term = 4,
    /// Entry panicked.
    Except = 5,
}

impl FiberState {
    #[inline(always)]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Exec,
            3 => Self::Hold,
            4 => Self::Term,
            _ => Self::Except,
        }
    }

    /// Terminal states: the entry has finished one way or the other.
    #[inline(always)]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    User,
    ThreadMain,
    /// Scheduling fiber of a `use_caller` thread; finishing it returns to
    /// the thread's main fiber rather than to a scheduling fiber.
    Scheduling,
}

/// A stackful coroutine.
///
/// Handles are reference counted; a fiber queued in a ready list and
/// referenced from a descriptor context stays alive until the last
/// reference is gone. The runtime only mutates a fiber's context from the
/// thread currently driving it, which is what makes the `Send + Sync`
/// below sound.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// `None` only for the thread main fiber.
    stack: Option<Stack>,
    sp: UnsafeCell<*mut u8>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    kind: Kind,
}

// SAFETY: `sp` and `entry` are only touched while the fiber is being
// driven by exactly one thread. The scheduler guarantees exclusivity by
// skipping fibers in Exec state and by consuming each queued task once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

struct ThreadFibers {
    current: Option<Arc<Fiber>>,
    main: Option<Arc<Fiber>>,
    scheduling: Option<Arc<Fiber>>,
}

thread_local! {
    static TL: RefCell<ThreadFibers> = RefCell::new(ThreadFibers {
        current: None,
        main: None,
        scheduling: None,
    });
}

impl Fiber {
    /// Create a fiber that will run `f` when first resumed.
    ///
    /// `stack_size == 0` picks the `fiber.stack_size` config value.
    pub fn new(f: impl FnOnce() + Send + 'static, stack_size: usize) -> Result<Arc<Fiber>> {
        Self::with_entry(Box::new(f), stack_size, Kind::User)
    }

    pub(crate) fn new_boxed(
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
    ) -> Result<Arc<Fiber>> {
        Self::with_entry(entry, stack_size, Kind::User)
    }

    /// The scheduling fiber of a `use_caller` thread; see [`Fiber::call`].
    pub(crate) fn new_scheduling(f: impl FnOnce() + Send + 'static) -> Result<Arc<Fiber>> {
        Self::with_entry(Box::new(f), 0, Kind::Scheduling)
    }

    fn with_entry(
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        kind: Kind,
    ) -> Result<Arc<Fiber>> {
        let size = if stack_size == 0 {
            STACK_SIZE.value() as usize
        } else {
            stack_size
        };
        let stack = Stack::new(size)?;
        TOTAL.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(stack),
            sp: UnsafeCell::new(std::ptr::null_mut()),
            entry: UnsafeCell::new(Some(entry)),
            kind,
        });
        unsafe {
            let top = fiber.stack.as_ref().unwrap().top();
            *fiber.sp.get() = switch::init_stack(top, fiber_entry, Arc::as_ptr(&fiber).cast());
        }
        Ok(fiber)
    }

    fn new_thread_main() -> Arc<Fiber> {
        TOTAL.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Exec as u8),
            stack: None,
            sp: UnsafeCell::new(std::ptr::null_mut()),
            entry: UnsafeCell::new(None),
            kind: Kind::ThreadMain,
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Re-initialize a finished (or never started) fiber around a new
    /// closure, reusing the already allocated stack.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, entry: Box<dyn FnOnce() + Send>) {
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Term | FiberState::Except
            ),
            "reset of fiber {} in state {state:?}",
            self.id,
        );
        let stack = self.stack.as_ref().expect("cannot reset a thread main fiber");
        unsafe {
            *self.entry.get() = Some(entry);
            *self.sp.get() =
                switch::init_stack(stack.top(), fiber_entry, self as *const Fiber as *const ());
        }
        self.set_state(FiberState::Init);
    }

    /// An owned handle to this fiber.
    ///
    /// Sound because every `Fiber` is constructed inside an [`Arc`] (the
    /// constructors return nothing else and the fields are private).
    fn arc_self(&self) -> Arc<Fiber> {
        unsafe {
            Arc::increment_strong_count(self as *const Fiber);
            Arc::from_raw(self as *const Fiber)
        }
    }

    /// Run the fiber until it yields or finishes. Must be called from the
    /// thread's scheduling context; the caller is suspended meanwhile.
    pub fn resume(&self) {
        let state = self.state();
        assert!(state != FiberState::Exec, "resume of a running fiber");
        assert!(!state.is_finished(), "resume of a finished fiber");
        let from = scheduling_fiber();
        assert!(
            !std::ptr::eq(self, Arc::as_ptr(&from)),
            "fiber cannot resume itself"
        );
        set_current(self.arc_self());
        self.set_state(FiberState::Exec);
        // Only one fiber per thread may be Exec; the suspending side goes
        // to Hold and is marked Exec again by whichever switch re-enters
        // it.
        from.set_state(FiberState::Hold);
        unsafe {
            switch::weft_switch(from.sp.get(), *self.sp.get());
        }
    }

    /// Enter a `use_caller` scheduling fiber from the thread's main fiber.
    /// Returns when the dispatch loop finishes.
    pub(crate) fn call(&self) {
        debug_assert_eq!(self.kind, Kind::Scheduling);
        let state = self.state();
        assert!(state != FiberState::Exec, "call of a running fiber");
        assert!(!state.is_finished(), "call of a finished fiber");
        let from = thread_main();
        set_current(self.arc_self());
        self.set_state(FiberState::Exec);
        from.set_state(FiberState::Hold);
        unsafe {
            switch::weft_switch(from.sp.get(), *self.sp.get());
        }
    }

    /// Suspend the running fiber in [`FiberState::Hold`]; something else
    /// (a timer, a readiness event, an explicit submit) must requeue it.
    pub fn yield_hold() {
        yield_with(FiberState::Hold);
    }

    /// Suspend the running fiber in [`FiberState::Ready`]; the scheduler
    /// requeues it automatically.
    pub fn yield_ready() {
        yield_with(FiberState::Ready);
    }

    /// The fiber currently executing on this thread, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        TL.with(|tl| tl.borrow().current.clone())
    }

    /// Id of the current fiber, 0 when called outside any fiber.
    pub fn current_id() -> u64 {
        TL.with(|tl| tl.borrow().current.as_ref().map_or(0, |f| f.id))
    }

    /// Number of live fibers in the process, thread main fibers included.
    pub fn total() -> u64 {
        TOTAL.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                state != FiberState::Exec,
                "fiber {} destroyed while executing",
                self.id,
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Id of the current fiber; free-function form used by the logger.
#[inline(always)]
pub fn current_id() -> u64 {
    Fiber::current_id()
}

/// The thread's main fiber, created on first use. Creating it also makes
/// it the current fiber and the default scheduling fiber of the thread.
pub(crate) fn thread_main() -> Arc<Fiber> {
    TL.with(|tl| {
        let mut tl = tl.borrow_mut();
        if let Some(main) = &tl.main {
            return main.clone();
        }
        let main = Fiber::new_thread_main();
        tl.main = Some(main.clone());
        if tl.current.is_none() {
            tl.current = Some(main.clone());
        }
        main
    })
}

/// Install the scheduling fiber of this thread (the fiber running the
/// dispatch loop). Cleared with `None` when a worker exits.
pub(crate) fn set_scheduling(fiber: Option<Arc<Fiber>>) {
    TL.with(|tl| tl.borrow_mut().scheduling = fiber);
}

fn scheduling_fiber() -> Arc<Fiber> {
    if let Some(f) = TL.with(|tl| tl.borrow().scheduling.clone()) {
        return f;
    }
    let main = thread_main();
    TL.with(|tl| tl.borrow_mut().scheduling = Some(main.clone()));
    main
}

fn set_current(fiber: Arc<Fiber>) {
    TL.with(|tl| tl.borrow_mut().current = Some(fiber));
}

fn yield_with(state: FiberState) {
    let cur = Fiber::current().expect("yield with no current fiber");
    let target = match cur.kind {
        Kind::Scheduling => thread_main(),
        _ => scheduling_fiber(),
    };
    assert!(
        !Arc::ptr_eq(&cur, &target),
        "the scheduling fiber cannot yield"
    );
    cur.set_state(state);
    set_current(target.clone());
    target.set_state(FiberState::Exec);
    let target_sp = unsafe { *target.sp.get() };
    drop(target);
    unsafe {
        switch::weft_switch(cur.sp.get(), target_sp);
    }
}

/// First and only frame of every fiber stack. Runs the entry closure,
/// records the outcome and leaves for the scheduling context for good.
extern "C" fn fiber_entry(arg: *const ()) -> ! {
    // The resuming side keeps an Arc alive for as long as we run.
    let fiber = unsafe { &*arg.cast::<Fiber>() };
    let entry = unsafe { (*fiber.entry.get()).take() };
    match panic::catch_unwind(AssertUnwindSafe(move || {
        (entry.expect("fiber resumed without an entry"))()
    })) {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            fiber.set_state(FiberState::Except);
            log::error!("fiber {} failed: {}", fiber.id, panic_message(&payload));
        }
    }
    let target = match fiber.kind {
        Kind::Scheduling => thread_main(),
        _ => scheduling_fiber(),
    };
    set_current(target.clone());
    target.set_state(FiberState::Exec);
    let target_sp = unsafe { *target.sp.get() };
    // Nothing on this stack runs again: drop every owned local before
    // switching away.
    drop(target);
    unsafe {
        switch::weft_switch(fiber.sp.get(), target_sp);
    }
    unreachable!("finished fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn resume_runs_to_completion() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let fiber = Fiber::new(
            || {
                HITS.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_and_resume_interleave() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let inner = log.clone();
        let fiber = Fiber::new(
            move || {
                inner.lock().unwrap().push("one");
                Fiber::yield_hold();
                inner.lock().unwrap().push("two");
                Fiber::yield_hold();
                inner.lock().unwrap().push("three");
            },
            16 * 1024,
        )
        .unwrap();
        fiber.resume();
        log.lock().unwrap().push("back");
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.resume();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["one", "back", "two", "three"],
        );
    }

    // A held region resumed any number of times sees the same effects as
    // a straight-line run.
    #[test]
    fn yield_resume_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let fiber = Fiber::new(
            move || {
                inner.fetch_add(1, Ordering::SeqCst);
                for _ in 0..10 {
                    Fiber::yield_hold();
                }
                inner.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        while !fiber.state().is_finished() {
            fiber.resume();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn yield_ready_marks_ready() {
        let fiber = Fiber::new(Fiber::yield_ready, 16 * 1024).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn panic_is_contained_as_except() {
        let fiber = Fiber::new(|| panic!("boom"), 16 * 1024).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        // The panicking fiber must not poison the thread.
        let ok = Fiber::new(|| {}, 16 * 1024).unwrap();
        ok.resume();
        assert_eq!(ok.state(), FiberState::Term);
    }

    #[test]
    fn reset_reuses_the_stack() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let fiber = Fiber::new(
            || {
                HITS.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        fiber.resume();
        fiber.reset(|| {
            HITS.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(HITS.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn current_id_inside_and_outside() {
        assert_eq!(Fiber::current_id(), Fiber::current_id());
        let seen = Arc::new(AtomicU64::new(0));
        let inner = seen.clone();
        let fiber = Fiber::new(
            move || {
                inner.store(Fiber::current_id(), Ordering::SeqCst);
            },
            16 * 1024,
        )
        .unwrap();
        let id = fiber.id();
        fiber.resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }

    #[test]
    fn ids_are_monotonic() {
        let a = Fiber::new(|| {}, 16 * 1024).unwrap();
        let b = Fiber::new(|| {}, 16 * 1024).unwrap();
        assert!(b.id() > a.id());
    }
}
