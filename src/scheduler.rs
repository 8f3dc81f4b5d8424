//! M:N fiber scheduler.
//!
//! A [`Scheduler`] multiplexes fibers and plain callables over a fixed
//! pool of worker threads. Tasks are consumed from one FIFO ready queue;
//! a task may be pinned to a single OS thread, otherwise any worker takes
//! it. There is no work stealing and no preemption: a fiber runs until it
//! yields, blocks in a hooked syscall or finishes.
//!
//! With `use_caller` the constructing thread is incorporated as an extra
//! worker: a dedicated scheduling fiber is created on it and driven to
//! quiescence inside [`Scheduler::stop`].
//!
//! The I/O manager ([`crate::reactor::Reactor`]) attaches itself to a
//! scheduler and overrides the idle behavior, the wake-up signal and the
//! termination predicate; without it the scheduler is purely
//! compute-bound.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, FiberState};
use crate::hook;
use crate::reactor::Reactor;

/// OS thread id of the calling thread.
pub fn current_tid() -> u64 {
    thread_local! {
        static TID: Cell<u64> = Cell::new(0);
    }
    TID.with(|tid| {
        let cached = tid.get();
        if cached != 0 {
            return cached;
        }
        let v = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        tid.set(v);
        v
    })
}

thread_local! {
    static CURRENT: RefCell<Option<Weak<Scheduler>>> = RefCell::new(None);
}

pub(crate) enum Job {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// One entry of the ready queue: a fiber or a callable, plus an optional
/// OS-thread pin. Consumed exactly once.
pub struct Task {
    pub(crate) job: Job,
    pub(crate) thread: Option<u64>,
}

impl Task {
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self {
            job: Job::Fiber(fiber),
            thread: None,
        }
    }

    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            job: Job::Call(Box::new(f)),
            thread: None,
        }
    }

    pub(crate) fn call_boxed(f: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            job: Job::Call(f),
            thread: None,
        }
    }

    /// Restrict the task to the worker with the given OS thread id.
    pub fn pinned(mut self, tid: u64) -> Self {
        self.thread = Some(tid);
        self
    }
}

pub struct Scheduler {
    name: String,
    /// Spawned worker threads; excludes the incorporated caller.
    workers: usize,
    use_caller: bool,
    root_tid: Option<u64>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    active: AtomicUsize,
    idlers: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    reactor: OnceCell<Weak<Reactor>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers in total. With
    /// `use_caller` the calling thread counts as one of them and one
    /// fewer thread is spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "a scheduler needs at least one thread");
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut workers = threads;
            let mut root_tid = None;
            let mut root_fiber = None;
            if use_caller {
                assert!(
                    Scheduler::current().is_none(),
                    "thread already belongs to a scheduler"
                );
                fiber::thread_main();
                workers -= 1;
                root_tid = Some(current_tid());
                let w = weak.clone();
                root_fiber = Some(
                    Fiber::new_scheduling(move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    })
                    .expect("failed to allocate the scheduling fiber"),
                );
                CURRENT.with(|c| *c.borrow_mut() = Some(weak.clone()));
            }
            Scheduler {
                name: name.to_string(),
                workers,
                use_caller,
                root_tid,
                root_fiber: Mutex::new(root_fiber),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                idlers: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(true),
                started: AtomicBool::new(false),
                reactor: OnceCell::new(),
            }
        })
    }

    /// The scheduler driving the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT.with(|c| c.borrow().as_ref()?.upgrade())
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach_reactor(&self, reactor: Weak<Reactor>) {
        if self.reactor.set(reactor).is_err() {
            panic!("a reactor is already attached to this scheduler");
        }
    }

    pub(crate) fn reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.get()?.upgrade()
    }

    /// An owned handle; sound because [`Scheduler::new`] only ever hands
    /// the scheduler out inside an [`Arc`].
    fn arc_self(&self) -> Arc<Scheduler> {
        unsafe {
            Arc::increment_strong_count(self as *const Scheduler);
            Arc::from_raw(self as *const Scheduler)
        }
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.workers {
            let sched = self.arc_self();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run())
                .expect("failed to spawn a worker thread");
            threads.push(handle);
        }
    }

    /// Queue a callable for any worker.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.submit_task(Task::call(f));
    }

    /// Queue a fiber, optionally pinned to one OS thread.
    pub fn submit_fiber(&self, fiber: Arc<Fiber>, thread: Option<u64>) {
        debug_assert!(!fiber.state().is_finished(), "submit of a finished fiber");
        self.submit_task(Task {
            job: Job::Fiber(fiber),
            thread,
        });
    }

    pub fn submit_task(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue several tasks atomically, waking at most one worker.
    pub fn submit_batch(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(tasks);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Signal shutdown, drain the queue and join the workers. With
    /// `use_caller` this must run on the incorporated thread, whose
    /// scheduling fiber is driven to quiescence here.
    pub fn stop(&self) {
        let current = Scheduler::current();
        if self.use_caller {
            assert!(
                current.map_or(false, |c| std::ptr::eq(Arc::as_ptr(&c), self)),
                "a use_caller scheduler must be stopped from its own thread"
            );
        } else {
            // Joining a worker from inside itself can never finish.
            assert!(
                current.map_or(true, |c| !std::ptr::eq(Arc::as_ptr(&c), self)),
                "a scheduler cannot be stopped from one of its own workers"
            );
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.workers {
            self.tickle();
        }
        let root = self.root_fiber.lock().unwrap().take();
        if let Some(root) = root {
            self.tickle();
            if !self.check_stopping() {
                fiber::set_scheduling(Some(root.clone()));
                root.call();
            }
            fiber::set_scheduling(None);
        }
        let threads = {
            let mut threads = self.threads.lock().unwrap();
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            let _ = handle.join();
        }
        log::info!("{} stopped", self.name);
    }

    pub(crate) fn has_idlers(&self) -> bool {
        self.idlers.load(Ordering::SeqCst) > 0
    }

    /// Wake an idle worker. The plain scheduler has nothing to do: its
    /// idle fiber polls the queue on every pass. The reactor overrides
    /// this with a self-pipe write.
    fn tickle(&self) {
        match self.reactor() {
            Some(reactor) => reactor.tickle(),
            None => log::trace!("{} tickle", self.name),
        }
    }

    /// Termination predicate of the plain scheduler.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().unwrap().is_empty()
    }

    fn check_stopping(&self) -> bool {
        match self.reactor() {
            Some(reactor) => reactor.stopping(),
            None => self.base_stopping(),
        }
    }

    fn idle_entry(&self) {
        match self.reactor() {
            Some(reactor) => reactor.idle(),
            None => {
                log::debug!("{} idle", self.name);
                while !self.check_stopping() {
                    Fiber::yield_hold();
                }
            }
        }
    }

    /// The dispatch loop; body of every worker thread and of the
    /// `use_caller` scheduling fiber.
    fn run(self: Arc<Self>) {
        log::debug!("{} run", self.name);
        hook::set_hook_enabled(true);
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&self)));
        let on_root = self.root_tid == Some(current_tid());
        let scheduling = if on_root {
            Fiber::current().expect("the root scheduling fiber is entered via call")
        } else {
            fiber::thread_main()
        };
        fiber::set_scheduling(Some(scheduling));

        let idle = {
            let sched = self.clone();
            Fiber::new(move || sched.idle_entry(), 0).expect("failed to allocate the idle fiber")
        };
        // One reusable fiber per worker wraps plain callables; its stack
        // is recycled through reset whenever the previous callable ran to
        // completion.
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut i = 0;
                while i < queue.len() {
                    if let Some(tid) = queue[i].thread {
                        if tid != current_tid() {
                            // Somebody else must take this one.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Job::Fiber(fiber) = &queue[i].job {
                        if fiber.state() == FiberState::Exec {
                            // Still being resumed elsewhere.
                            i += 1;
                            continue;
                        }
                    }
                    task = queue.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.job) {
                Some(Job::Fiber(fiber)) if !fiber.state().is_finished() => {
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.submit_fiber(fiber, None),
                        state if !state.is_finished() => fiber.set_state(FiberState::Hold),
                        _ => {}
                    }
                }
                Some(Job::Fiber(_)) => {
                    // Finished while queued; nothing to run.
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Job::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(cb);
                            fiber
                        }
                        None => Fiber::new_boxed(cb, 0)
                            .expect("failed to allocate a callback fiber"),
                    };
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.submit_fiber(fiber, None),
                        state if state.is_finished() => cb_fiber = Some(fiber),
                        _ => {
                            // Parked in a timer or a descriptor context;
                            // it owns the stack until resumed.
                            fiber.set_state(FiberState::Hold);
                        }
                    }
                }
                None => {
                    if idle.state() == FiberState::Term {
                        log::debug!("{} idle fiber term", self.name);
                        break;
                    }
                    self.idlers.fetch_add(1, Ordering::SeqCst);
                    idle.resume();
                    self.idlers.fetch_sub(1, Ordering::SeqCst);
                    if !idle.state().is_finished() {
                        idle.set_state(FiberState::Hold);
                    }
                }
            }
        }

        fiber::set_scheduling(None);
        CURRENT.with(|c| *c.borrow_mut() = None);
        hook::set_hook_enabled(false);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("use_caller", &self.use_caller)
            .finish_non_exhaustive()
    }
}
