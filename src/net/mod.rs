//! Networking collaborators of the runtime: address values, a socket
//! wrapper whose blocking-looking calls go through the hook layer, and
//! TCP server scaffolding.

pub mod addr;
pub mod socket;
pub mod tcp;

pub use addr::{Addr, AddrV4, AddrV6, UnixAddr};
pub use socket::Socket;
pub use tcp::{ClientHandler, TcpServer};
