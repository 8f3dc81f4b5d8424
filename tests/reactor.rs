use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use weft::clock;
use weft::hook;
use weft::net::{Addr, Socket};
use weft::reactor::{EventSet, Reactor};
use weft::timer::Timer;

const RECV_WAIT: Duration = Duration::from_secs(10);

// Scenario: sleep(2) inside a fiber on a single worker; exactly one
// completion and at least two seconds of wall clock.
#[test]
fn sleep_inside_fiber() {
    let reactor = Reactor::new(1, false, "sleep").unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    reactor.submit(move || {
        hook::sleep(Duration::from_secs(2));
        tx.send("done").unwrap();
    });
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), "done");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(rx.try_recv().is_err());
    reactor.stop();
}

// Two sleepers on one worker overlap instead of serializing.
#[test]
fn sleeps_overlap_on_a_single_worker() {
    let reactor = Reactor::new(1, false, "overlap").unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    for _ in 0..3 {
        let tx = tx.clone();
        reactor.submit(move || {
            hook::sleep(Duration::from_millis(300));
            tx.send(()).unwrap();
        });
    }
    for _ in 0..3 {
        rx.recv_timeout(RECV_WAIT).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(800));
    reactor.stop();
}

// Scenario: a 5 s one-shot cancelled after 10 ms never fires.
#[test]
fn timer_cancelled_before_fire_never_runs() {
    let reactor = Reactor::new(1, false, "cancel").unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let inner = fired.clone();
    let timer = reactor.add_timer(5000, move || inner.store(true, Ordering::SeqCst), false);
    std::thread::sleep(Duration::from_millis(10));
    assert!(timer.cancel());
    std::thread::sleep(Duration::from_millis(100));
    assert!(!fired.load(Ordering::SeqCst));
    assert!(!reactor.has_timer());
    reactor.stop();
}

// Scenario: 100 ms recurring timer, reset to 200 ms from now after the
// third firing; over the next second that yields 5 +/- 1 firings.
#[test]
fn periodic_timer_with_reset() {
    let reactor = Reactor::new(1, false, "periodic").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
    let reset_at = Arc::new(AtomicUsize::new(0));

    let inner_count = count.clone();
    let inner_slot = slot.clone();
    let inner_reset_at = reset_at.clone();
    let timer = reactor.add_timer(
        100,
        move || {
            let n = inner_count.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                let guard = inner_slot.lock().unwrap();
                let timer = guard.as_ref().expect("handle installed before firing");
                assert!(timer.reset(200, true));
                inner_reset_at.store(clock::monotonic_ms() as usize, Ordering::SeqCst);
            }
        },
        true,
    );
    *slot.lock().unwrap() = Some(timer);

    let deadline = Instant::now() + RECV_WAIT;
    let reset_at = loop {
        let at = reset_at.load(Ordering::SeqCst);
        if at != 0 {
            break at as u64;
        }
        assert!(Instant::now() < deadline, "timer never reached 3 firings");
        std::thread::sleep(Duration::from_millis(10));
    };
    while clock::monotonic_ms() < reset_at + 1000 {
        std::thread::sleep(Duration::from_millis(20));
    }
    let timer = slot.lock().unwrap().take().unwrap();
    timer.cancel();
    let late = count.load(Ordering::SeqCst) - 3;
    assert!((4..=6).contains(&late), "late firings: {late}");
    reactor.stop();
}

// Scenario: echo over loopback on a single-worker reactor; the bytes
// read back equal the bytes sent.
#[test]
fn echo_over_loopback() {
    let reactor = Reactor::new(1, false, "echo").unwrap();
    let (port_tx, port_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    reactor.submit(move || {
        let any = Addr::lookup_any("127.0.0.1:0").unwrap();
        let listener = Socket::tcp(&any).unwrap();
        listener.bind(&any).unwrap();
        listener.listen(16).unwrap();
        port_tx.send(listener.local_addr().unwrap()).unwrap();

        let client = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        assert!(client.recv_exact(&mut buf).unwrap());
        client.send_all(&buf).unwrap();
    });

    let addr = port_rx.recv_timeout(RECV_WAIT).unwrap();
    reactor.submit(move || {
        let sock = Socket::tcp(&addr).unwrap();
        sock.connect(&addr).unwrap();
        let sent: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        sock.send_all(&sent).unwrap();
        let mut got = [0u8; 1024];
        assert!(sock.recv_exact(&mut got).unwrap());
        assert_eq!(&got[..], &sent[..]);
        done_tx.send(()).unwrap();
    });

    done_rx.recv_timeout(RECV_WAIT).unwrap();
    reactor.stop();
}

// Scenario: connect to an unroutable address with a 250 ms timeout.
#[test]
fn connect_timeout_on_unroutable_address() {
    let reactor = Reactor::new(1, false, "connect").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        let addr = Addr::lookup_any("10.255.255.1:80").unwrap();
        let sock = Socket::tcp(&addr).unwrap();
        let started = Instant::now();
        let err = sock
            .connect_with_timeout(&addr, Duration::from_millis(250))
            .unwrap_err();
        tx.send((err, started.elapsed())).unwrap();
    });
    let (err, elapsed) = rx.recv_timeout(RECV_WAIT).unwrap();
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => {
            assert!(elapsed >= Duration::from_millis(250), "returned early: {elapsed:?}");
            assert!(elapsed < Duration::from_millis(1000), "returned late: {elapsed:?}");
        }
        // Some environments reject the route outright instead of
        // blackholing it; then there is nothing to time.
        Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) | Some(libc::ECONNREFUSED) => {}
        other => panic!("unexpected connect error {other:?}: {err}"),
    }
    reactor.stop();
}

// cancel_event submits the stored continuation instead of dropping it.
#[test]
fn cancel_event_fires_the_stored_callback() {
    let reactor = Reactor::new(1, false, "cancel_event").unwrap();
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (tx, rx) = mpsc::channel();

    let inner = reactor.clone();
    reactor.submit(move || {
        let notify = tx.clone();
        inner
            .add_event(
                fds[0],
                EventSet::READ,
                Some(Box::new(move || notify.send("fired").unwrap())),
            )
            .unwrap();
        assert_eq!(inner.pending_events(), 1);
        assert!(inner.cancel_event(fds[0], EventSet::READ));
        tx.send("cancelled").unwrap();
    });

    let mut got = vec![
        rx.recv_timeout(RECV_WAIT).unwrap(),
        rx.recv_timeout(RECV_WAIT).unwrap(),
    ];
    got.sort_unstable();
    assert_eq!(got, vec!["cancelled", "fired"]);
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

// del_event drops the continuation silently; cancel_all wakes both
// directions and empties the registration.
#[test]
fn del_event_is_silent_and_cancel_all_clears() {
    let reactor = Reactor::new(1, false, "cancel_all").unwrap();
    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    let (tx, rx) = mpsc::channel();

    let inner = reactor.clone();
    reactor.submit(move || {
        let dropped = tx.clone();
        inner
            .add_event(
                fds[0],
                EventSet::READ,
                Some(Box::new(move || dropped.send("read: dropped").unwrap())),
            )
            .unwrap();
        assert!(inner.del_event(fds[0], EventSet::READ));
        assert_eq!(inner.pending_events(), 0);
        // Re-arm both directions, then cancel everything.
        let read_tx = tx.clone();
        inner
            .add_event(
                fds[0],
                EventSet::READ,
                Some(Box::new(move || read_tx.send("read").unwrap())),
            )
            .unwrap();
        let write_tx = tx.clone();
        inner
            .add_event(
                fds[0],
                EventSet::WRITE,
                Some(Box::new(move || write_tx.send("write").unwrap())),
            )
            .unwrap();
        assert_eq!(inner.pending_events(), 2);
        assert!(inner.cancel_all(fds[0]));
    });

    let mut got = vec![
        rx.recv_timeout(RECV_WAIT).unwrap(),
        rx.recv_timeout(RECV_WAIT).unwrap(),
    ];
    got.sort_unstable();
    assert_eq!(got, vec!["read", "write"]);
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

// A socket read with a receive timeout reports TimedOut when the peer
// stays quiet, and the operation has not completed.
#[test]
fn recv_timeout_fires_as_timed_out() {
    let reactor = Reactor::new(1, false, "recv_timeout").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        let any = Addr::lookup_any("127.0.0.1:0").unwrap();
        let listener = Socket::tcp(&any).unwrap();
        listener.bind(&any).unwrap();
        listener.listen(4).unwrap();
        let addr = listener.local_addr().unwrap();

        let quiet = Socket::tcp(&addr).unwrap();
        quiet.connect(&addr).unwrap();
        quiet.set_recv_timeout(Some(Duration::from_millis(150))).unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = quiet.recv(&mut buf).unwrap_err();
        tx.send((err, started.elapsed())).unwrap();
    });
    let (err, elapsed) = rx.recv_timeout(RECV_WAIT).unwrap();
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    assert!(elapsed >= Duration::from_millis(150));
    reactor.stop();
}

// Scenario: use-caller reactor; everything drains inside stop on the
// calling thread.
#[test]
fn use_caller_reactor_runs_on_the_caller() {
    let reactor = Reactor::new(1, true, "uc").unwrap();
    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        hook::sleep(Duration::from_millis(50));
        tx.send(weft::scheduler::current_tid()).unwrap();
    });
    reactor.stop();
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(1)).unwrap(),
        weft::scheduler::current_tid()
    );
}

// Hook transparency: outside any runtime the redirected calls behave
// like the plain blocking ones.
#[test]
fn hooks_fall_back_outside_the_runtime() {
    assert!(!hook::is_hook_enabled());
    let started = Instant::now();
    hook::sleep(Duration::from_millis(50));
    assert!(started.elapsed() >= Duration::from_millis(50));
}
