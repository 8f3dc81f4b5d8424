use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::fiber::{Fiber, FiberState};
use weft::scheduler::{current_tid, Scheduler, Task};

const RECV_WAIT: Duration = Duration::from_secs(10);

#[test]
fn submitted_callables_run() {
    let sched = Scheduler::new(2, false, "calls");
    sched.start();
    let (tx, rx) = mpsc::channel();
    for i in 0..10 {
        let tx = tx.clone();
        sched.submit(move || tx.send(i).unwrap());
    }
    let mut got: Vec<i32> = (0..10).map(|_| rx.recv_timeout(RECV_WAIT).unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
    sched.stop();
}

#[test]
fn single_worker_preserves_fifo_order() {
    let sched = Scheduler::new(1, false, "fifo");
    sched.start();
    let order = Arc::new(Mutex::new(Vec::new()));
    let batch = (0..16)
        .map(|i| {
            let order = order.clone();
            Task::call(move || order.lock().unwrap().push(i))
        })
        .collect();
    let (tx, rx) = mpsc::channel();
    sched.submit_batch(batch);
    sched.submit(move || tx.send(()).unwrap());
    rx.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    sched.stop();
}

#[test]
fn submitted_fibers_run_and_finish() {
    let sched = Scheduler::new(2, false, "fibers");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = hits.clone();
    let fiber = Fiber::new(
        move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_ready();
            inner.fetch_add(1, Ordering::SeqCst);
        },
        0,
    )
    .unwrap();
    sched.submit_fiber(fiber.clone(), None);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), FiberState::Term);
}

// Scenario: a task pinned to thread k runs on thread k, and nowhere else.
#[test]
fn affinity_pins_tasks_to_one_thread() {
    let sched = Scheduler::new(3, false, "affinity");
    sched.start();

    let (tx, rx) = mpsc::channel();
    sched.submit(move || tx.send(current_tid()).unwrap());
    let target = rx.recv_timeout(RECV_WAIT).unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..32 {
        let tx = tx.clone();
        sched.submit_task(Task::call(move || tx.send(current_tid()).unwrap()).pinned(target));
    }
    for _ in 0..32 {
        assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), target);
    }
    sched.stop();
}

// Scenario: a panicking fiber reaches Except, is not requeued, and the
// scheduler keeps serving later submissions.
#[test]
fn panicking_fiber_does_not_poison_the_scheduler() {
    let sched = Scheduler::new(1, false, "poison");
    sched.start();

    let bad = Fiber::new(|| panic!("intentional test panic"), 0).unwrap();
    sched.submit_fiber(bad.clone(), None);

    let (tx, rx) = mpsc::channel();
    sched.submit(move || tx.send("alive").unwrap());
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), "alive");
    assert_eq!(bad.state(), FiberState::Except);
    sched.stop();
}

#[test]
fn use_caller_scheduler_drains_inside_stop() {
    // One thread total and it is the caller: nothing runs until stop.
    let sched = Scheduler::new(1, true, "caller");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    let tid = Arc::new(Mutex::new(0u64));
    for _ in 0..5 {
        let hits = hits.clone();
        let tid = tid.clone();
        sched.submit(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            *tid.lock().unwrap() = current_tid();
        });
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
    // Everything ran on the incorporated caller thread.
    assert_eq!(*tid.lock().unwrap(), current_tid());
}

#[test]
fn use_caller_mixes_with_worker_threads() {
    let sched = Scheduler::new(2, true, "mixed");
    sched.start();
    let (tx, rx) = mpsc::channel();
    for i in 0..8 {
        let tx = tx.clone();
        sched.submit(move || tx.send(i).unwrap());
    }
    // One spawned worker can already make progress before stop.
    let mut seen = vec![rx.recv_timeout(RECV_WAIT).unwrap()];
    sched.stop();
    while let Ok(i) = rx.try_recv() {
        seen.push(i);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
}

// A fiber yielding Ready is requeued by the scheduler itself until done.
#[test]
fn yield_ready_is_requeued_automatically() {
    let sched = Scheduler::new(1, false, "ready");
    sched.start();
    let (tx, rx) = mpsc::channel();
    let fiber = Fiber::new(
        move || {
            for round in 0..5 {
                tx.send(round).unwrap();
                Fiber::yield_ready();
            }
        },
        0,
    )
    .unwrap();
    sched.submit_fiber(fiber, None);
    for round in 0..5 {
        assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), round);
    }
    sched.stop();
}
