//! Socket address values.
//!
//! [`Addr`] wraps the raw `sockaddr` blob of one of the supported
//! families (IPv4, IPv6, Unix, or an unknown family kept verbatim) and
//! is what the socket wrapper passes through to the hooked syscalls.
//! [`Addr::lookup`] resolves `host`, `host:service`, `[v6]` and
//! `[v6]:service` forms through `getaddrinfo`.

use std::ffi::{CStr, CString};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// A resolved socket address of any supported family.
#[derive(Clone)]
pub enum Addr {
    V4(AddrV4),
    V6(AddrV6),
    Unix(UnixAddr),
    Unknown(UnknownAddr),
}

impl Addr {
    /// Rebuild an address from a raw sockaddr blob (as returned by
    /// `accept`, `recvfrom`, `getsockname`, ...).
    pub fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Addr {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_in>() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (storage as *const libc::sockaddr_storage).cast::<u8>(),
                        (&mut inner as *mut libc::sockaddr_in).cast::<u8>(),
                        std::mem::size_of::<libc::sockaddr_in>(),
                    );
                }
                Addr::V4(AddrV4 { inner })
            }
            libc::AF_INET6 => {
                let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_in6>() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (storage as *const libc::sockaddr_storage).cast::<u8>(),
                        (&mut inner as *mut libc::sockaddr_in6).cast::<u8>(),
                        std::mem::size_of::<libc::sockaddr_in6>(),
                    );
                }
                Addr::V6(AddrV6 { inner })
            }
            libc::AF_UNIX => {
                let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_un>() };
                let n = (len as usize).min(std::mem::size_of::<libc::sockaddr_un>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (storage as *const libc::sockaddr_storage).cast::<u8>(),
                        (&mut inner as *mut libc::sockaddr_un).cast::<u8>(),
                        n,
                    );
                }
                Addr::Unix(UnixAddr { inner, len })
            }
            _ => Addr::Unknown(UnknownAddr {
                storage: *storage,
                len,
            }),
        }
    }

    pub fn family(&self) -> i32 {
        match self {
            Addr::V4(_) => libc::AF_INET,
            Addr::V6(_) => libc::AF_INET6,
            Addr::Unix(_) => libc::AF_UNIX,
            Addr::Unknown(a) => a.storage.ss_family as i32,
        }
    }

    /// Raw blob pointer for syscalls.
    pub fn sockaddr(&self) -> *const libc::sockaddr {
        match self {
            Addr::V4(a) => (&a.inner as *const libc::sockaddr_in).cast(),
            Addr::V6(a) => (&a.inner as *const libc::sockaddr_in6).cast(),
            Addr::Unix(a) => (&a.inner as *const libc::sockaddr_un).cast(),
            Addr::Unknown(a) => (&a.storage as *const libc::sockaddr_storage).cast(),
        }
    }

    pub fn socklen(&self) -> libc::socklen_t {
        match self {
            Addr::V4(_) => std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            Addr::V6(_) => std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            Addr::Unix(a) => a.len,
            Addr::Unknown(a) => a.len,
        }
    }

    /// Port of an IP address, `None` for other families.
    pub fn port(&self) -> Option<u16> {
        match self {
            Addr::V4(a) => Some(a.port()),
            Addr::V6(a) => Some(a.port()),
            _ => None,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            Addr::V4(a) => a.set_port(port),
            Addr::V6(a) => a.set_port(port),
            _ => {}
        }
    }

    /// Resolve a `host`, `host:service`, `[v6]` or `[v6]:service` string
    /// into every address `getaddrinfo` reports for it.
    pub fn lookup(host: &str) -> Result<Vec<Addr>> {
        let (node, service) = split_host_service(host)?;
        let node = CString::new(node).map_err(|_| Error::InvalidAddress(host.to_string()))?;
        let service = service
            .map(|s| CString::new(s).map_err(|_| Error::InvalidAddress(host.to_string())))
            .transpose()?;

        let hints = unsafe {
            let mut hints = std::mem::zeroed::<libc::addrinfo>();
            hints.ai_family = libc::AF_UNSPEC;
            hints.ai_socktype = 0;
            hints
        };
        let mut res: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                node.as_ptr(),
                service.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
                &hints,
                &mut res,
            )
        };
        if rc != 0 {
            let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
            log::error!(
                "getaddrinfo('{host}') failed: {}",
                reason.to_string_lossy()
            );
            return Err(Error::Resolve(host.to_string()));
        }

        let mut out = Vec::new();
        let mut next = res;
        while !next.is_null() {
            let ai = unsafe { &*next };
            if !ai.ai_addr.is_null() {
                let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ai.ai_addr.cast::<u8>(),
                        (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
                        (ai.ai_addrlen as usize)
                            .min(std::mem::size_of::<libc::sockaddr_storage>()),
                    );
                }
                let addr = Addr::from_raw(&storage, ai.ai_addrlen);
                // getaddrinfo may report one endpoint per socket type.
                if !out.iter().any(|a: &Addr| a == &addr) {
                    out.push(addr);
                }
            }
            next = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(res) };
        if out.is_empty() {
            return Err(Error::Resolve(host.to_string()));
        }
        Ok(out)
    }

    /// First result of [`Addr::lookup`].
    pub fn lookup_any(host: &str) -> Result<Addr> {
        Ok(Self::lookup(host)?.remove(0))
    }
}

/// Split `host[:service]`, validating the `[v6]` bracket form before any
/// indexing.
fn split_host_service(host: &str) -> Result<(&str, Option<&str>)> {
    if host.is_empty() {
        return Err(Error::InvalidAddress(host.to_string()));
    }
    if let Some(rest) = host.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(host.to_string()))?;
        let node = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((node, None));
        }
        let service = tail
            .strip_prefix(':')
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidAddress(host.to_string()))?;
        return Ok((node, Some(service)));
    }
    // Multiple colons without brackets: a bare IPv6 literal.
    if host.matches(':').count() > 1 {
        return Ok((host, None));
    }
    match host.split_once(':') {
        None => Ok((host, None)),
        Some((_, "")) => Err(Error::InvalidAddress(host.to_string())),
        Some((node, service)) => Ok((node, Some(service))),
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        if self.family() != other.family() || self.socklen() != other.socklen() {
            return false;
        }
        let n = self.socklen() as usize;
        let a = unsafe { std::slice::from_raw_parts(self.sockaddr().cast::<u8>(), n) };
        let b = unsafe { std::slice::from_raw_parts(other.sockaddr().cast::<u8>(), n) };
        a == b
    }
}

impl Eq for Addr {}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::V4(a) => write!(f, "{}:{}", a.ip(), a.port()),
            Addr::V6(a) => write!(f, "[{}]:{}", a.ip(), a.port()),
            Addr::Unix(a) => write!(f, "{}", a.path()),
            Addr::Unknown(a) => write!(f, "<family {}>", a.storage.ss_family),
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

////////////////////////////////////////////////////////////////////////////
// IPv4
////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy)]
pub struct AddrV4 {
    inner: libc::sockaddr_in,
}

impl AddrV4 {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_in>() };
        inner.sin_family = libc::AF_INET as libc::sa_family_t;
        inner.sin_port = port.to_be();
        inner.sin_addr = libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        };
        Self { inner }
    }

    /// `0.0.0.0:port`.
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.inner.sin_addr.s_addr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.inner.sin_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.inner.sin_port = port.to_be();
    }

    fn mask(prefix_len: u8) -> u32 {
        assert!(prefix_len <= 32, "ipv4 prefix out of range");
        if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        }
    }

    /// Host bits all-zeros.
    pub fn network_address(&self, prefix_len: u8) -> AddrV4 {
        let ip = u32::from(self.ip()) & Self::mask(prefix_len);
        Self::new(Ipv4Addr::from(ip), self.port())
    }

    /// Host bits all-ones.
    pub fn broadcast_address(&self, prefix_len: u8) -> AddrV4 {
        let ip = u32::from(self.ip()) | !Self::mask(prefix_len);
        Self::new(Ipv4Addr::from(ip), self.port())
    }

    pub fn subnet_mask(prefix_len: u8) -> AddrV4 {
        Self::new(Ipv4Addr::from(Self::mask(prefix_len)), 0)
    }
}

////////////////////////////////////////////////////////////////////////////
// IPv6
////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy)]
pub struct AddrV6 {
    inner: libc::sockaddr_in6,
}

impl AddrV6 {
    pub fn new(ip: Ipv6Addr, port: u16) -> Self {
        let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_in6>() };
        inner.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        inner.sin6_port = port.to_be();
        inner.sin6_addr = libc::in6_addr {
            s6_addr: ip.octets(),
        };
        Self { inner }
    }

    pub fn any(port: u16) -> Self {
        Self::new(Ipv6Addr::UNSPECIFIED, port)
    }

    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.inner.sin6_addr.s6_addr)
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.inner.sin6_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.inner.sin6_port = port.to_be();
    }

    /// Fill the host part of `octets` with ones or zeros. The byte index
    /// is `prefix_len / 8` counted from the leading byte; the remainder
    /// bits form the mask of the straddling byte.
    fn fill_host(mut octets: [u8; 16], prefix_len: u8, ones: bool) -> [u8; 16] {
        assert!(prefix_len <= 128, "ipv6 prefix out of range");
        let index = (prefix_len / 8) as usize;
        let remainder = prefix_len % 8;
        if index < 16 {
            let network_mask: u8 = if remainder == 0 {
                0
            } else {
                0xff << (8 - remainder)
            };
            if ones {
                octets[index] |= !network_mask;
            } else {
                octets[index] &= network_mask;
            }
            for byte in octets.iter_mut().skip(index + 1) {
                *byte = if ones { 0xff } else { 0 };
            }
        }
        octets
    }

    pub fn network_address(&self, prefix_len: u8) -> AddrV6 {
        let octets = Self::fill_host(self.ip().octets(), prefix_len, false);
        Self::new(Ipv6Addr::from(octets), self.port())
    }

    pub fn broadcast_address(&self, prefix_len: u8) -> AddrV6 {
        let octets = Self::fill_host(self.ip().octets(), prefix_len, true);
        Self::new(Ipv6Addr::from(octets), self.port())
    }

    pub fn subnet_mask(prefix_len: u8) -> AddrV6 {
        let octets = Self::fill_host([0xff; 16], prefix_len, false);
        Self::new(Ipv6Addr::from(octets), 0)
    }
}

////////////////////////////////////////////////////////////////////////////
// Unix
////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy)]
pub struct UnixAddr {
    inner: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl UnixAddr {
    pub fn new(path: &str) -> Result<Self> {
        let mut inner = unsafe { std::mem::zeroed::<libc::sockaddr_un>() };
        inner.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.contains(&0) || bytes.len() >= inner.sun_path.len() {
            return Err(Error::InvalidAddress(path.to_string()));
        }
        for (dst, src) in inner.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let header = std::mem::size_of::<libc::sockaddr_un>() - inner.sun_path.len();
        Ok(Self {
            inner,
            len: (header + bytes.len() + 1) as libc::socklen_t,
        })
    }

    pub fn path(&self) -> String {
        let header = std::mem::size_of::<libc::sockaddr_un>() - self.inner.sun_path.len();
        let n = (self.len as usize).saturating_sub(header + 1);
        self.inner.sun_path[..n]
            .iter()
            .map(|&c| c as u8 as char)
            .collect()
    }
}

#[derive(Clone, Copy)]
pub struct UnknownAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn v4_round_trip_through_raw() {
        let addr = AddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 8080);
        assert_eq!(addr.ip(), Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(addr.port(), 8080);
        assert_eq!(Addr::V4(addr).to_string(), "192.168.1.20:8080");
    }

    #[test]
    fn v4_subnet_math() {
        let addr = AddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 0);
        assert_eq!(
            addr.network_address(24).ip(),
            Ipv4Addr::new(192, 168, 1, 0)
        );
        assert_eq!(
            addr.broadcast_address(24).ip(),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            AddrV4::subnet_mask(20).ip(),
            Ipv4Addr::new(255, 255, 240, 0)
        );
        assert_eq!(addr.network_address(0).ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            addr.broadcast_address(32).ip(),
            Ipv4Addr::new(192, 168, 1, 20)
        );
    }

    #[test]
    fn v6_subnet_math_counts_from_the_leading_byte() {
        let ip: Ipv6Addr = "2001:db8:aaaa:bbbb::1".parse().unwrap();
        let addr = AddrV6::new(ip, 0);
        // /56: seven full network bytes, all host bytes below.
        let network = addr.network_address(56).ip().octets();
        assert_eq!(&network[..7], &ip.octets()[..7]);
        assert!(network[7..].iter().all(|&b| b == 0));
        let broadcast = addr.broadcast_address(56).ip().octets();
        assert_eq!(&broadcast[..7], &ip.octets()[..7]);
        assert!(broadcast[7..].iter().all(|&b| b == 0xff));
        // /52: the straddling byte keeps its top nibble.
        let mask = AddrV6::subnet_mask(52).ip().octets();
        assert_eq!(mask[6], 0xf0);
        assert!(mask[..6].iter().all(|&b| b == 0xff));
        assert!(mask[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn unix_path_round_trip() {
        let addr = UnixAddr::new("/tmp/weft.sock").unwrap();
        assert_eq!(addr.path(), "/tmp/weft.sock");
        assert!(UnixAddr::new("bad\0path").is_err());
    }

    #[test]
    fn malformed_bracket_form_is_rejected() {
        assert!(Addr::lookup("[::1").is_err());
        assert!(Addr::lookup("[::1]x80").is_err());
        assert!(Addr::lookup("host:").is_err());
        assert!(Addr::lookup("").is_err());
    }

    #[test]
    fn split_forms() {
        assert_eq!(
            split_host_service("[::1]:80").unwrap(),
            ("::1", Some("80"))
        );
        assert_eq!(split_host_service("[::1]").unwrap(), ("::1", None));
        assert_eq!(
            split_host_service("127.0.0.1:80").unwrap(),
            ("127.0.0.1", Some("80"))
        );
        assert_eq!(split_host_service("::1").unwrap(), ("::1", None));
        assert_eq!(
            split_host_service("example.com:http").unwrap(),
            ("example.com", Some("http"))
        );
    }

    #[test]
    fn loopback_lookup_resolves() {
        let addrs = Addr::lookup("127.0.0.1:80").unwrap();
        assert!(addrs
            .iter()
            .any(|a| a.to_string() == "127.0.0.1:80"));
    }
}
