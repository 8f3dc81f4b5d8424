//! Socket wrapper.
//!
//! [`Socket`] pairs a descriptor with its family/type/protocol triple and
//! routes every potentially blocking operation through the hook layer,
//! so code using it suspends the calling fiber instead of the thread.
//! Inside a reactor worker that is transparent; outside one the calls
//! behave like their plain blocking counterparts.
//!
//! Closing takes `&self` (the descriptor is swapped out atomically):
//! shutdown paths must be able to close a listener that an accept loop
//! still holds, so the parked fiber retries, observes `EBADF` and exits.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use crate::hook;
use crate::net::addr::Addr;
use crate::reactor::{EventSet, Reactor};

#[inline]
fn cvt(t: libc::c_int) -> io::Result<libc::c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

pub struct Socket {
    /// -1 once closed.
    fd: AtomicI32,
    family: i32,
    ty: i32,
    protocol: i32,
    connected: AtomicBool,
}

impl Socket {
    /// A TCP socket of the same family as `addr`.
    pub fn tcp(addr: &Addr) -> io::Result<Socket> {
        Self::new(addr.family(), libc::SOCK_STREAM, 0)
    }

    /// A UDP socket of the same family as `addr`.
    pub fn udp(addr: &Addr) -> io::Result<Socket> {
        let sock = Self::new(addr.family(), libc::SOCK_DGRAM, 0)?;
        sock.connected.store(true, Ordering::Relaxed);
        Ok(sock)
    }

    pub fn new(family: i32, ty: i32, protocol: i32) -> io::Result<Socket> {
        let fd = hook::socket(family, ty, protocol)?;
        let sock = Socket {
            fd: AtomicI32::new(fd),
            family,
            ty,
            protocol,
            connected: AtomicBool::new(false),
        };
        sock.init_options();
        Ok(sock)
    }

    fn from_accepted(fd: RawFd, family: i32, ty: i32, protocol: i32) -> Socket {
        let sock = Socket {
            fd: AtomicI32::new(fd),
            family,
            ty,
            protocol,
            connected: AtomicBool::new(true),
        };
        sock.init_options();
        sock
    }

    fn init_options(&self) {
        let _ = self.set_opt_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
        if self.ty == libc::SOCK_STREAM && self.family != libc::AF_UNIX {
            let _ = self.set_opt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        }
    }

    fn set_opt_int(&self, level: i32, name: i32, value: i32) -> io::Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                self.fd(),
                level,
                name,
                (&value as *const i32).cast(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.fd() >= 0
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn bind(&self, addr: &Addr) -> io::Result<()> {
        cvt(unsafe { libc::bind(self.fd(), addr.sockaddr(), addr.socklen()) }).map(drop)
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        cvt(unsafe { libc::listen(self.fd(), backlog) }).map(drop)
    }

    /// Accept one connection; suspends the calling fiber until a peer
    /// arrives (or the receive timeout fires).
    pub fn accept(&self) -> io::Result<Socket> {
        let fd = hook::accept(self.fd())?;
        Ok(Socket::from_accepted(fd, self.family, self.ty, self.protocol))
    }

    /// Connect with the process-wide configured TCP connect timeout.
    pub fn connect(&self, addr: &Addr) -> io::Result<()> {
        hook::connect(self.fd(), addr.sockaddr(), addr.socklen())?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Connect bounded by an explicit timeout.
    pub fn connect_with_timeout(&self, addr: &Addr, timeout: Duration) -> io::Result<()> {
        hook::connect_with_timeout(
            self.fd(),
            addr.sockaddr(),
            addr.socklen(),
            Some(timeout.as_millis() as u64),
        )?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        hook::recv(self.fd(), buf, 0)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        hook::send(self.fd(), buf, 0)
    }

    /// Send the whole buffer, suspending as needed.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.send(buf)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Fill the whole buffer; `Ok(false)` on clean EOF at offset zero.
    pub fn recv_exact(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.recv(&mut buf[offset..])?;
            if n == 0 {
                if offset == 0 {
                    return Ok(false);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            offset += n;
        }
        Ok(true)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
        let (n, storage, len) = hook::recvfrom(self.fd(), buf, 0)?;
        Ok((n, Addr::from_raw(&storage, len)))
    }

    pub fn send_to(&self, buf: &[u8], addr: &Addr) -> io::Result<usize> {
        hook::sendto(self.fd(), buf, 0, addr.sockaddr(), addr.socklen())
    }

    pub fn readv(&self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        hook::readv(self.fd(), bufs)
    }

    pub fn writev(&self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        hook::writev(self.fd(), bufs)
    }

    /// Gather-write raw iovecs (for node-chained buffers).
    pub fn writev_raw(&self, iovs: &[libc::iovec]) -> io::Result<usize> {
        hook::writev_raw(self.fd(), iovs)
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_recv_timeout(self.fd(), timeout)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        hook::recv_timeout(self.fd())
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_send_timeout(self.fd(), timeout)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        hook::send_timeout(self.fd())
    }

    pub fn local_addr(&self) -> io::Result<Addr> {
        self.name_addr(libc::getsockname)
    }

    pub fn peer_addr(&self) -> io::Result<Addr> {
        self.name_addr(libc::getpeername)
    }

    fn name_addr(
        &self,
        f: unsafe extern "C" fn(
            libc::c_int,
            *mut libc::sockaddr,
            *mut libc::socklen_t,
        ) -> libc::c_int,
    ) -> io::Result<Addr> {
        let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            f(
                self.fd(),
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        })?;
        Ok(Addr::from_raw(&storage, len))
    }

    /// Wake a fiber parked on READ readiness for this socket.
    pub fn cancel_read(&self) -> bool {
        Reactor::current().map_or(false, |r| r.cancel_event(self.fd(), EventSet::READ))
    }

    /// Wake a fiber parked on WRITE readiness for this socket.
    pub fn cancel_write(&self) -> bool {
        Reactor::current().map_or(false, |r| r.cancel_event(self.fd(), EventSet::WRITE))
    }

    /// Wake everything parked on this socket.
    pub fn cancel_all(&self) -> bool {
        Reactor::current().map_or(false, |r| r.cancel_all(self.fd()))
    }

    /// Close the descriptor, first waking every parked fiber. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return Ok(());
        }
        self.connected.store(false, Ordering::Relaxed);
        hook::close(fd)
    }
}

impl AsRawFd for Socket {
    #[inline(always)]
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("failed closing socket descriptor: {e}");
        }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket[fd={} family={} type={} protocol={} connected={}",
            self.fd(),
            self.family,
            self.ty,
            self.protocol,
            self.is_connected(),
        )?;
        if let Ok(local) = self.local_addr() {
            write!(f, " local={local}")?;
        }
        if let Ok(peer) = self.peer_addr() {
            write!(f, " peer={peer}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
