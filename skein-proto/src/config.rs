//! Host configuration and the optional compression/checksum hooks.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::protocol;

pub const HOST_DEFAULT_MTU: u32 = 1392;
pub const HOST_BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
pub const HOST_DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const HOST_DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Parameters fixed at host creation.
///
/// Channel, bandwidth, and MTU limits can be adjusted later through the host;
/// the peer-slot count cannot.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of peer slots; also the range of valid wire peer IDs.
    pub peer_count: usize,
    /// Maximum channels granted to an incoming connection; clamped to
    /// `1..=255`.
    pub channel_limit: usize,
    /// Inbound bandwidth in bytes/second advertised to peers; 0 means
    /// unlimited.
    pub incoming_bandwidth: u32,
    /// Outbound bandwidth in bytes/second enforced by the bandwidth throttle;
    /// 0 means unlimited.
    pub outgoing_bandwidth: u32,
    /// Datagram size assumed for new connections, clamped during the
    /// handshake to `576..=4096`.
    pub mtu: u32,
    /// Largest packet accepted for sending or reassembly.
    pub maximum_packet_size: usize,
    /// Ceiling on buffered incoming packet bytes per peer; packets past it
    /// are dropped without acknowledgement.
    pub maximum_waiting_data: usize,
    /// How many not-yet-disconnected peers may share one remote address
    /// before further connects from it are refused.
    pub duplicate_peers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 1,
            channel_limit: protocol::MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: HOST_DEFAULT_MTU,
            maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: protocol::MAXIMUM_PEER_ID as usize,
        }
    }
}

impl HostConfig {
    pub fn new(peer_count: usize) -> Self {
        Self {
            peer_count,
            ..Self::default()
        }
    }
}

/// Datagram payload compressor.
///
/// Compression runs over the command section of an assembled datagram; the
/// result is used only when it is strictly smaller than the input.
pub trait Compressor {
    /// Compress `input` into `output`, returning the compressed length, or
    /// `None` when the result would not fit.
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
    /// Decompress `input` into `output`, returning the decompressed length,
    /// or `None` on malformed input or overflow.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
}

/// Whole-datagram checksum.
pub trait Checksum {
    fn checksum(&self, data: &[u8]) -> u32;
}

/// CRC-32 (ISO-HDLC) checksum.
pub struct Crc32 {
    crc: Crc<u32>,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self {
            crc: Crc::<u32>::new(&CRC_32_ISO_HDLC),
        }
    }
}

impl Checksum for Crc32 {
    fn checksum(&self, data: &[u8]) -> u32 {
        self.crc.checksum(data)
    }
}
