//! Standard-library UDP binding for the `skein-proto` transport engine.
//!
//! ```no_run
//! use skein::{HostConfig, Packet, StdSocket};
//!
//! let socket = StdSocket::bind("0.0.0.0:7777".parse().unwrap()).unwrap();
//! let mut host = skein::Host::new(socket, HostConfig::new(32)).unwrap();
//! let peer = host.connect("203.0.113.5:7777".parse().unwrap(), 2, 0).unwrap();
//! loop {
//!     match host.service(100).unwrap() {
//!         Some(skein::Event::Connect { .. }) => {
//!             host.send(peer, 0, Packet::reliable(&b"hello"[..])).unwrap();
//!         }
//!         Some(event) => println!("{event:?}"),
//!         None => {}
//!     }
//! }
//! ```

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};

pub use skein_proto::{
    Checksum, Clock, Compressor, ConfigError, ConnectError, Crc32, Event, HostConfig, Packet,
    PacketFlags, Peer, PeerId, PeerState, SendError, Socket, SteadyClock,
};

/// A host driven by a standard-library UDP socket.
pub type Host = skein_proto::Host<StdSocket>;

const RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
const SEND_BUFFER_SIZE: usize = 256 * 1024;

/// Non-blocking UDP socket with the buffer sizing the transport expects.
pub struct StdSocket {
    io: UdpSocket,
}

impl StdSocket {
    /// Bind to `address`, typically `0.0.0.0:0` for a client.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let raw = RawSocket::new(
            Domain::for_address(address),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        raw.set_recv_buffer_size(RECEIVE_BUFFER_SIZE)?;
        raw.set_send_buffer_size(SEND_BUFFER_SIZE)?;
        raw.set_broadcast(true)?;
        raw.bind(&address.into())?;
        raw.set_nonblocking(true)?;
        Ok(Self { io: raw.into() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }
}

impl Socket for StdSocket {
    fn send(&mut self, remote: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.io.send_to(data, remote)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.io.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool> {
        if timeout_ms == 0 {
            return Ok(false);
        }
        // A one-byte peek under a read timeout doubles as readiness polling
        // without pulling in an event-loop dependency.
        self.io.set_nonblocking(false)?;
        self.io
            .set_read_timeout(Some(Duration::from_millis(u64::from(timeout_ms))))?;
        let mut probe = [0u8; 1];
        let result = match self.io.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(false)
            }
            Err(error) => Err(error),
        };
        self.io.set_read_timeout(None)?;
        self.io.set_nonblocking(true)?;
        result
    }
}
