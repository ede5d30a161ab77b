//! Wire-level command model.
//!
//! A datagram is a 2-byte peer-id/flags word, an optional 2-byte sent-time
//! stamp, an optional 4-byte checksum slot, and then up to
//! [`MAXIMUM_PACKET_COMMANDS`] commands. Every command starts with a 4-byte
//! header whose first byte carries the opcode in its low nibble and the
//! acknowledge/unsequenced flags in its top two bits.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};

pub const MINIMUM_MTU: u32 = 576;
pub const MAXIMUM_MTU: u32 = 4096;
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Commands on this channel belong to the connection itself rather than to an
/// application channel.
pub const SYSTEM_CHANNEL_ID: u8 = 0xFF;

pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;
const COMMAND_MASK: u8 = 0x0F;

pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;

/// Size of the datagram header without the sent-time stamp.
pub const BASE_HEADER_SIZE: usize = 2;
/// Size of the datagram header including the sent-time stamp.
pub const FULL_HEADER_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
const COMMAND_HEADER_SIZE: usize = 4;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("truncated command")]
    UnexpectedEnd,
    #[error("unknown command opcode {0}")]
    UnknownOpcode(u8),
}

impl From<coding::UnexpectedEnd> for DecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

impl Opcode {
    fn from_u8(x: u8) -> Option<Self> {
        use Opcode::*;
        Some(match x {
            1 => Acknowledge,
            2 => Connect,
            3 => VerifyConnect,
            4 => Disconnect,
            5 => Ping,
            6 => SendReliable,
            7 => SendUnreliable,
            8 => SendFragment,
            9 => SendUnsequenced,
            10 => BandwidthLimit,
            11 => ThrottleConfigure,
            12 => SendUnreliableFragment,
            _ => return None,
        })
    }
}

/// Negotiation parameters carried by `Connect` and `VerifyConnect`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ConnectParams {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

impl ConnectParams {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self {
            outgoing_peer_id: buf.get()?,
            incoming_session_id: buf.get()?,
            outgoing_session_id: buf.get()?,
            mtu: buf.get()?,
            window_size: buf.get()?,
            channel_count: buf.get()?,
            incoming_bandwidth: buf.get()?,
            outgoing_bandwidth: buf.get()?,
            packet_throttle_interval: buf.get()?,
            packet_throttle_acceleration: buf.get()?,
            packet_throttle_deceleration: buf.get()?,
            connect_id: buf.get()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.outgoing_peer_id);
        buf.write(self.incoming_session_id);
        buf.write(self.outgoing_session_id);
        buf.write(self.mtu);
        buf.write(self.window_size);
        buf.write(self.channel_count);
        buf.write(self.incoming_bandwidth);
        buf.write(self.outgoing_bandwidth);
        buf.write(self.packet_throttle_interval);
        buf.write(self.packet_throttle_acceleration);
        buf.write(self.packet_throttle_deceleration);
        buf.write(self.connect_id);
    }
}

/// Geometry of one fragment of a larger packet.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FragmentInfo {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

impl FragmentInfo {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self {
            start_sequence_number: buf.get()?,
            data_length: buf.get()?,
            fragment_count: buf.get()?,
            fragment_number: buf.get()?,
            total_length: buf.get()?,
            fragment_offset: buf.get()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.start_sequence_number);
        buf.write(self.data_length);
        buf.write(self.fragment_count);
        buf.write(self.fragment_number);
        buf.write(self.total_length);
        buf.write(self.fragment_offset);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect {
        params: ConnectParams,
        data: u32,
    },
    VerifyConnect {
        params: ConnectParams,
    },
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendFragment(FragmentInfo),
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    SendUnreliableFragment(FragmentInfo),
}

impl CommandBody {
    pub fn opcode(&self) -> Opcode {
        use CommandBody::*;
        match self {
            Acknowledge { .. } => Opcode::Acknowledge,
            Connect { .. } => Opcode::Connect,
            VerifyConnect { .. } => Opcode::VerifyConnect,
            Disconnect { .. } => Opcode::Disconnect,
            Ping => Opcode::Ping,
            SendReliable { .. } => Opcode::SendReliable,
            SendUnreliable { .. } => Opcode::SendUnreliable,
            SendFragment(_) => Opcode::SendFragment,
            SendUnsequenced { .. } => Opcode::SendUnsequenced,
            BandwidthLimit { .. } => Opcode::BandwidthLimit,
            ThrottleConfigure { .. } => Opcode::ThrottleConfigure,
            SendUnreliableFragment(_) => Opcode::SendUnreliableFragment,
        }
    }
}

/// One protocol command, decoupled from any payload bytes that follow it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    /// `COMMAND_FLAG_*` bits
    pub flags: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub body: CommandBody,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    /// Wire size of the command itself, excluding any trailing payload.
    pub fn size(&self) -> usize {
        command_size(self.opcode())
    }

    /// Decode one command and split off its payload, if the opcode carries one.
    pub fn decode(buf: &mut Bytes) -> Result<(Self, Bytes), DecodeError> {
        if buf.remaining() < COMMAND_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEnd);
        }
        let command: u8 = buf.get()?;
        let channel_id: u8 = buf.get()?;
        let reliable_sequence_number: u16 = buf.get()?;
        let opcode =
            Opcode::from_u8(command & COMMAND_MASK).ok_or(DecodeError::UnknownOpcode(command))?;
        let flags = command & (COMMAND_FLAG_ACKNOWLEDGE | COMMAND_FLAG_UNSEQUENCED);

        use Opcode::*;
        let (body, data_length) = match opcode {
            Acknowledge => (
                CommandBody::Acknowledge {
                    received_reliable_sequence_number: buf.get()?,
                    received_sent_time: buf.get()?,
                },
                0,
            ),
            Connect => {
                let params = ConnectParams::decode(buf)?;
                let data = buf.get()?;
                (CommandBody::Connect { params, data }, 0)
            }
            VerifyConnect => (
                CommandBody::VerifyConnect {
                    params: ConnectParams::decode(buf)?,
                },
                0,
            ),
            Disconnect => (CommandBody::Disconnect { data: buf.get()? }, 0),
            Ping => (CommandBody::Ping, 0),
            SendReliable => {
                let data_length: u16 = buf.get()?;
                (CommandBody::SendReliable { data_length }, data_length)
            }
            SendUnreliable => {
                let unreliable_sequence_number = buf.get()?;
                let data_length: u16 = buf.get()?;
                (
                    CommandBody::SendUnreliable {
                        unreliable_sequence_number,
                        data_length,
                    },
                    data_length,
                )
            }
            SendFragment => {
                let info = FragmentInfo::decode(buf)?;
                (CommandBody::SendFragment(info), info.data_length)
            }
            SendUnsequenced => {
                let unsequenced_group = buf.get()?;
                let data_length: u16 = buf.get()?;
                (
                    CommandBody::SendUnsequenced {
                        unsequenced_group,
                        data_length,
                    },
                    data_length,
                )
            }
            BandwidthLimit => (
                CommandBody::BandwidthLimit {
                    incoming_bandwidth: buf.get()?,
                    outgoing_bandwidth: buf.get()?,
                },
                0,
            ),
            ThrottleConfigure => (
                CommandBody::ThrottleConfigure {
                    packet_throttle_interval: buf.get()?,
                    packet_throttle_acceleration: buf.get()?,
                    packet_throttle_deceleration: buf.get()?,
                },
                0,
            ),
            SendUnreliableFragment => {
                let info = FragmentInfo::decode(buf)?;
                (CommandBody::SendUnreliableFragment(info), info.data_length)
            }
        };

        let data_length = usize::from(data_length);
        if buf.remaining() < data_length {
            return Err(DecodeError::UnexpectedEnd);
        }
        let payload = buf.split_to(data_length);
        Ok((
            Self {
                flags,
                channel_id,
                reliable_sequence_number,
                body,
            },
            payload,
        ))
    }

    /// Append the command (without any payload) to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.opcode() as u8 | self.flags);
        buf.write(self.channel_id);
        buf.write(self.reliable_sequence_number);
        use CommandBody::*;
        match &self.body {
            Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                buf.write(*received_reliable_sequence_number);
                buf.write(*received_sent_time);
            }
            Connect { params, data } => {
                params.encode(buf);
                buf.write(*data);
            }
            VerifyConnect { params } => params.encode(buf),
            Disconnect { data } => buf.write(*data),
            Ping => {}
            SendReliable { data_length } => buf.write(*data_length),
            SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                buf.write(*unreliable_sequence_number);
                buf.write(*data_length);
            }
            SendFragment(info) | SendUnreliableFragment(info) => info.encode(buf),
            SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                buf.write(*unsequenced_group);
                buf.write(*data_length);
            }
            BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.write(*incoming_bandwidth);
                buf.write(*outgoing_bandwidth);
            }
            ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buf.write(*packet_throttle_interval);
                buf.write(*packet_throttle_acceleration);
                buf.write(*packet_throttle_deceleration);
            }
        }
    }
}

/// Fixed wire size of each opcode, excluding trailing payload bytes.
pub fn command_size(opcode: Opcode) -> usize {
    use Opcode::*;
    COMMAND_HEADER_SIZE
        + match opcode {
            Acknowledge => 4,
            Connect => 48 - COMMAND_HEADER_SIZE,
            VerifyConnect => 44 - COMMAND_HEADER_SIZE,
            Disconnect => 4,
            Ping => 0,
            SendReliable => 2,
            SendUnreliable => 4,
            SendFragment | SendUnreliableFragment => 20,
            SendUnsequenced => 4,
            BandwidthLimit => 8,
            ThrottleConfigure => 12,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(command: Command, payload: &[u8]) {
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        assert_eq!(buf.len(), command.size());
        buf.extend_from_slice(payload);
        let mut bytes = buf.freeze();
        let (decoded, data) = Command::decode(&mut bytes).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(&data[..], payload);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn command_roundtrips() {
        roundtrip(
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: 2,
                reliable_sequence_number: 7,
                body: CommandBody::SendReliable { data_length: 3 },
            },
            b"abc",
        );
        roundtrip(
            Command {
                flags: 0,
                channel_id: SYSTEM_CHANNEL_ID,
                reliable_sequence_number: 1,
                body: CommandBody::Acknowledge {
                    received_reliable_sequence_number: 9,
                    received_sent_time: 0x1234,
                },
            },
            b"",
        );
        roundtrip(
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: 0,
                reliable_sequence_number: 4,
                body: CommandBody::SendFragment(FragmentInfo {
                    start_sequence_number: 4,
                    data_length: 2,
                    fragment_count: 3,
                    fragment_number: 1,
                    total_length: 100,
                    fragment_offset: 40,
                }),
            },
            b"xy",
        );
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut buf = Bytes::from_static(&[13, 0, 0, 0]);
        assert_eq!(
            Command::decode(&mut buf).unwrap_err(),
            DecodeError::UnknownOpcode(13)
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut buf = BytesMut::new();
        Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 1,
            body: CommandBody::SendReliable { data_length: 10 },
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"short");
        assert_eq!(
            Command::decode(&mut buf.freeze()).unwrap_err(),
            DecodeError::UnexpectedEnd
        );
    }
}
