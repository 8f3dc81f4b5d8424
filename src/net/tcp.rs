//! TCP server scaffolding.
//!
//! A [`TcpServer`] owns a set of listening sockets and two reactors: the
//! *acceptor* runs one accept-loop fiber per listener, the *worker* runs
//! one handler fiber per accepted connection. They may be the same
//! reactor. Binding is all-or-nothing: when any address fails, the whole
//! set is reported and nothing stays bound.
//!
//! Create and bind the server from a runtime fiber: descriptors opened on
//! hooked threads are the ones the hook layer can multiplex, and only
//! those accept loops can be woken for shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::error::{Error, Result};
use crate::net::addr::Addr;
use crate::net::socket::Socket;
use crate::reactor::Reactor;

static READ_TIMEOUT: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    Config::lookup(
        "tcp_server.read_timeout",
        2 * 60 * 1000u64,
        "tcp server receive timeout in ms",
    )
    .expect("tcp_server.read_timeout registration cannot fail")
});

/// What a server does with one accepted connection. The handler runs in
/// its own fiber on the worker reactor.
pub trait ClientHandler: Send + Sync + 'static {
    fn handle(&self, client: Socket);
}

impl<F> ClientHandler for F
where
    F: Fn(Socket) + Send + Sync + 'static,
{
    fn handle(&self, client: Socket) {
        self(client)
    }
}

pub struct TcpServer {
    name: String,
    worker: Arc<Reactor>,
    acceptor: Arc<Reactor>,
    handler: Arc<dyn ClientHandler>,
    listeners: Mutex<Vec<Arc<Socket>>>,
    recv_timeout_ms: AtomicU64,
    stopped: AtomicBool,
}

impl TcpServer {
    pub fn new(
        name: &str,
        handler: Arc<dyn ClientHandler>,
        worker: Arc<Reactor>,
        acceptor: Arc<Reactor>,
    ) -> Arc<TcpServer> {
        Arc::new(TcpServer {
            name: name.to_string(),
            worker,
            acceptor,
            handler,
            listeners: Mutex::new(Vec::new()),
            recv_timeout_ms: AtomicU64::new(READ_TIMEOUT.value()),
            stopped: AtomicBool::new(true),
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_recv_timeout(&self, timeout: Duration) {
        self.recv_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Bind and listen on one address.
    pub fn bind(&self, addr: &Addr) -> Result<()> {
        self.bind_all(std::slice::from_ref(addr))
            .map_err(|mut failed| {
                Error::other(format!("failed to bind {}", failed.remove(0)))
            })
    }

    /// Bind and listen on every address; on failure returns the addresses
    /// that failed and keeps nothing bound.
    pub fn bind_all(&self, addrs: &[Addr]) -> std::result::Result<(), Vec<Addr>> {
        let mut failed = Vec::new();
        let mut bound = Vec::new();
        for addr in addrs {
            let sock = match Socket::tcp(addr) {
                Ok(sock) => sock,
                Err(e) => {
                    log::error!("{}: socket for {addr} failed: {e}", self.name);
                    failed.push(addr.clone());
                    continue;
                }
            };
            if let Err(e) = sock.bind(addr) {
                log::error!("{}: bind {addr} failed: {e}", self.name);
                failed.push(addr.clone());
                continue;
            }
            if let Err(e) = sock.listen(libc::SOMAXCONN) {
                log::error!("{}: listen {addr} failed: {e}", self.name);
                failed.push(addr.clone());
                continue;
            }
            bound.push(Arc::new(sock));
        }
        if !failed.is_empty() {
            return Err(failed);
        }
        for sock in &bound {
            log::info!("{}: server bind success: {sock}", self.name);
        }
        self.listeners.lock().unwrap().extend(bound);
        Ok(())
    }

    /// Local addresses actually bound (useful after binding port 0).
    pub fn local_addrs(&self) -> Vec<Addr> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|sock| sock.local_addr().ok())
            .collect()
    }

    /// An owned handle; sound because [`TcpServer::new`] only ever hands
    /// the server out inside an [`Arc`].
    fn arc_self(&self) -> Arc<TcpServer> {
        unsafe {
            Arc::increment_strong_count(self as *const TcpServer);
            Arc::from_raw(self as *const TcpServer)
        }
    }

    /// Schedule one accept loop per listener on the acceptor reactor.
    pub fn start(&self) {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for sock in listeners {
            let server = self.arc_self();
            self.acceptor.submit(move || server.accept_loop(sock));
        }
    }

    /// Stop accepting: cancel pending accepts and close the listeners.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let server = self.arc_self();
        self.acceptor.submit(move || {
            let listeners = std::mem::take(&mut *server.listeners.lock().unwrap());
            for sock in listeners {
                sock.cancel_all();
                // Parked accept fibers retry, hit EBADF and exit.
                if let Err(e) = sock.close() {
                    log::warn!("{}: closing listener failed: {e}", server.name);
                }
            }
        });
    }

    fn accept_loop(&self, sock: Arc<Socket>) {
        while !self.is_stopped() {
            match sock.accept() {
                Ok(client) => {
                    if let Err(e) = client.set_recv_timeout(Some(self.recv_timeout())) {
                        log::warn!("{}: set_recv_timeout failed: {e}", self.name);
                    }
                    let handler = self.handler.clone();
                    self.worker.submit(move || handler.handle(client));
                }
                Err(e) => {
                    // A closed listener fails on every retry; transient
                    // failures (ECONNABORTED and friends) do not.
                    if self.is_stopped() || e.raw_os_error() == Some(libc::EBADF) {
                        break;
                    }
                    log::error!("{}: accept failed: {e}", self.name);
                }
            }
        }
    }
}
