//! The UDP socket capability the engine is driven through.
//!
//! The engine performs no I/O of its own; anything that can move datagrams
//! and report readiness can host it, including the in-memory sockets the
//! tests use.

use std::io;
use std::net::SocketAddr;

/// Non-blocking datagram socket.
pub trait Socket {
    /// Send one datagram. `Err(WouldBlock)` ends the current send pass
    /// without advancing any queues.
    fn send(&mut self, remote: SocketAddr, data: &[u8]) -> io::Result<usize>;

    /// Receive one datagram if one is ready; `Ok(None)` when none is.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Wait up to `timeout_ms` for a datagram to become readable. Returns
    /// whether one is.
    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool>;
}
