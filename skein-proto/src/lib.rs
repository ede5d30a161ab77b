//! State machine for a reliable, sequenced, multi-channel datagram transport
//! over UDP.
//!
//! A [`Host`] multiplexes up to 4095 logical peers over a single UDP
//! endpoint. Each peer carries up to 255 independent channels, and every
//! packet picks one of four delivery disciplines: reliable and sequenced,
//! unreliable and sequenced, unreliable and unsequenced, or fragmented when
//! the payload does not fit one datagram. The engine handles connection
//! handshaking, acknowledgements and retransmission, fragment reassembly,
//! RTT-driven throttling of unreliable traffic, and host-wide bandwidth
//! fairness.
//!
//! The engine performs no I/O of its own: the UDP socket and the millisecond
//! clock are injected capabilities ([`Socket`], [`Clock`]), which keeps the
//! protocol fully deterministic under test. The `skein` crate supplies the
//! standard-library socket binding.

mod coding;
mod config;
mod host;
mod packet;
mod peer;
mod protocol;
mod socket;
mod timing;

#[cfg(test)]
mod tests;

pub use crate::config::{Checksum, Compressor, Crc32, HostConfig};
pub use crate::host::{ConfigError, ConnectError, Event, Host, PeerId, SendError};
pub use crate::packet::{Packet, PacketFlags};
pub use crate::peer::{Peer, PeerState};
pub use crate::protocol::{
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PACKET_COMMANDS,
    MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
    MINIMUM_WINDOW_SIZE,
};
pub use crate::socket::Socket;
pub use crate::timing::{Clock, SteadyClock};
