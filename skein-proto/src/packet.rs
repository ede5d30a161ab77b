//! Application-visible packets and the engine's shared references to them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Bit flags governing how a packet is delivered.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PacketFlags(pub u32);

impl PacketFlags {
    /// Resend until the remote peer acknowledges receipt.
    pub const RELIABLE: Self = Self(1 << 0);
    /// Deliver without sequencing against other packets.
    pub const UNSEQUENCED: Self = Self(1 << 1);
    /// Fragment with unreliable sends when the payload exceeds the MTU.
    pub const UNRELIABLE_FRAGMENT: Self = Self(1 << 3);
    /// Set by the engine once the packet has left every send queue.
    pub const SENT: Self = Self(1 << 8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A payload submitted for transmission or handed out on receipt.
///
/// The payload is immutable once submitted; `Bytes` makes cloning and
/// fragment slicing cheap.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    flags: PacketFlags,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// A packet delivered reliably and in sequence.
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// A packet delivered at most once, in sequence with other packets on its
    /// channel.
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::default())
    }

    /// A packet delivered at most once, outside any sequencing.
    pub fn unsequenced(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub(crate) fn into_shared(self) -> Arc<SharedPacket> {
        Arc::new(SharedPacket {
            data: self.data,
            flags: AtomicU32::new(self.flags.0),
        })
    }
}

/// An outgoing packet shared between the commands that carry its fragments.
///
/// The flag word is the only mutable state: the `SENT` bit is set when the
/// last command referencing the packet retires after a transmission.
#[derive(Debug)]
pub(crate) struct SharedPacket {
    data: Bytes,
    flags: AtomicU32,
}

impl SharedPacket {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags(self.flags.load(Ordering::Relaxed))
    }

    pub fn mark_sent(&self) {
        self.flags.fetch_or(PacketFlags::SENT.0, Ordering::Relaxed);
    }
}

/// Drop a command's packet reference, recording whether the payload ever made
/// it onto the wire before the final reference went away.
pub(crate) fn retire(packet: Arc<SharedPacket>, was_sent: bool) {
    if was_sent && Arc::strong_count(&packet) == 1 {
        packet.mark_sent();
    }
    drop(packet);
}
