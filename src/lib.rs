//! Weft: an M:N stackful fiber runtime with cooperative network I/O.
//!
//! Many lightweight fibers are multiplexed over a small fixed pool of
//! worker threads, and blocking-looking socket code transparently
//! suspends the calling fiber until the kernel reports readiness. The
//! library contains:
//!
//! - [Fibers: stackful coroutines with explicit resume/yield](fiber)
//! - [The scheduler: thread pool + FIFO ready queue](scheduler)
//! - [The timer queue: one-shot, recurring and conditional timers](timer)
//! - [The reactor: epoll-driven I/O manager fused with the timers](reactor)
//! - [The hook layer: redirected blocking syscalls](hook)
//! - [Per-fd bookkeeping](fd)
//! - [Address, socket and TCP server helpers](net)
//! - [An HTTP/1.x endpoint built on all of the above](http)
//! - [Typed configuration with change listeners](config)
//! - [Chain-of-nodes byte buffer with wire codecs](buffer)
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! A minimal HTTP server (sockets are created on runtime threads so the
//! hook layer manages their descriptors):
//! ```no_run
//! use weft::http::HttpServer;
//! use weft::net::Addr;
//! use weft::reactor::Reactor;
//!
//! let reactor = Reactor::new(2, true, "main").unwrap();
//! let (worker, acceptor) = (reactor.clone(), reactor.clone());
//! reactor.submit(move || {
//!     let server = HttpServer::server(true, None, worker, acceptor);
//!     server.bind(&Addr::lookup_any("0.0.0.0:8020").unwrap()).unwrap();
//!     server.start();
//! });
//! // Serves until stopped; with use_caller the caller drains here.
//! reactor.stop();
//! ```
//!
//! Inside a worker everything that would block a thread instead parks a
//! fiber: `weft::hook::sleep`, socket reads and writes, `connect` with
//! its configured timeout. Outside the runtime the same calls behave
//! like their plain blocking counterparts.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod http;
pub mod log;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
