//! Per-peer connection state: queues, sequencing, RTT tracking, and the
//! packet throttle.
//!
//! A peer's methods never touch the socket; the host's send and receive
//! pipelines drive them and own every transition that needs host-wide state
//! (the dispatch queue is threaded in explicitly where delivery may become
//! possible).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use crate::packet::{Packet, PacketFlags, SharedPacket};
use crate::protocol::{
    command_size, Command, CommandBody, Opcode, COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED,
    MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, SYSTEM_CHANNEL_ID,
};
use crate::timing::time_difference;

pub(crate) mod channel;
pub(crate) use channel::Channel;
use channel::{FREE_RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};

pub(crate) const PEER_DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub(crate) const PEER_DEFAULT_PACKET_THROTTLE: u32 = 32;
pub(crate) const PEER_PACKET_THROTTLE_SCALE: u32 = 32;
pub(crate) const PEER_PACKET_THROTTLE_COUNTER: u32 = 7;
pub(crate) const PEER_PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub(crate) const PEER_PACKET_THROTTLE_DECELERATION: u32 = 2;
pub(crate) const PEER_PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub(crate) const PEER_PACKET_LOSS_SCALE: u32 = 1 << 16;
pub(crate) const PEER_PACKET_LOSS_INTERVAL: u32 = 10_000;
pub(crate) const PEER_WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub(crate) const PEER_TIMEOUT_LIMIT: u32 = 32;
pub(crate) const PEER_TIMEOUT_MINIMUM: u32 = 5000;
pub(crate) const PEER_TIMEOUT_MAXIMUM: u32 = 30_000;
pub(crate) const PEER_PING_INTERVAL: u32 = 500;
pub(crate) const PEER_UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub(crate) const PEER_FREE_UNSEQUENCED_WINDOWS: u32 = 32;

const UNSEQUENCED_WINDOW_WORDS: usize = (PEER_UNSEQUENCED_WINDOW_SIZE / 32) as usize;

pub(crate) const PEER_FLAG_NEEDS_DISPATCH: u16 = 1 << 0;
pub(crate) const PEER_FLAG_CONTINUE_SENDING: u16 = 1 << 1;

/// Connection lifecycle of a peer slot.
///
/// The discriminant order is meaningful: everything from
/// `ConnectionPending` up has completed enough of the handshake to count as
/// connected for bookkeeping purposes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

/// A pending acknowledgement of a received reliable command.
pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub opcode: Opcode,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

/// An outgoing command, together with its transmission bookkeeping.
pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub queue_time: u32,
    pub send_attempts: u16,
    pub packet: Option<Arc<SharedPacket>>,
}

/// A received command buffered for sequencing or reassembly.
pub(crate) struct IncomingCommand {
    pub opcode: Opcode,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    /// Bitmap of received fragment numbers; present iff `fragment_count > 0`.
    pub fragments: Option<Box<[u32]>>,
    pub data: BytesMut,
    pub packet_flags: PacketFlags,
}

impl IncomingCommand {
    pub fn has_fragment(&self, number: u32) -> bool {
        self.fragments.as_ref().map_or(false, |bits| {
            bits[(number / 32) as usize] & (1 << (number % 32)) != 0
        })
    }

    pub fn mark_fragment(&mut self, number: u32) {
        if let Some(bits) = self.fragments.as_mut() {
            bits[(number / 32) as usize] |= 1 << (number % 32);
        }
    }
}

/// Outcome of trying to buffer a received command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum QueueOutcome {
    Queued,
    /// Benignly dropped: stale, duplicate, or arriving while the peer winds
    /// down.
    Discarded,
}

/// The command could not be buffered; the rest of the datagram is abandoned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Rejected;

pub struct Peer {
    pub(crate) incoming_peer_id: u16,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,
    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,
    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) reliable_data_in_transit: u32,
    pub(crate) outgoing_reliable_sequence_number: u16,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; UNSEQUENCED_WINDOW_WORDS],
    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,
    pub(crate) flags: u16,
    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) outgoing_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_send_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, host_mtu: u32) -> Self {
        let mut peer = Self {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: PEER_DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PEER_PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PEER_PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PEER_PACKET_THROTTLE_INTERVAL,
            ping_interval: PEER_PING_INTERVAL,
            timeout_limit: PEER_TIMEOUT_LIMIT,
            timeout_minimum: PEER_TIMEOUT_MINIMUM,
            timeout_maximum: PEER_TIMEOUT_MAXIMUM,
            round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            last_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; UNSEQUENCED_WINDOW_WORDS],
            event_data: 0,
            total_waiting_data: 0,
            flags: 0,
            acknowledgements: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            outgoing_send_reliable_commands: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
        };
        peer.reset(host_mtu);
        peer
    }

    /// Reinitialize every statistic and queue; the slot becomes available for
    /// a fresh connection. Host-level bookkeeping (connected-peer counters,
    /// the dispatch queue) is the host's to fix up around this call.
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = PEER_DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PEER_PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PEER_PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PEER_PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PEER_PING_INTERVAL;
        self.timeout_limit = PEER_TIMEOUT_LIMIT;
        self.timeout_minimum = PEER_TIMEOUT_MINIMUM;
        self.timeout_maximum = PEER_TIMEOUT_MAXIMUM;
        self.round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.last_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.flags = 0;
        self.unsequenced_window = [0; UNSEQUENCED_WINDOW_WORDS];
        self.reset_queues();
    }

    /// Drop every queued command and release the channels. Packet references
    /// go with the commands that held them.
    pub(crate) fn reset_queues(&mut self) {
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.outgoing_commands.clear();
        self.outgoing_send_reliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    pub(crate) fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty()
            || !self.outgoing_send_reliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    /// Assign sequence numbers and place the command on the right outgoing
    /// queue.
    pub(crate) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand, queue_time: u32) {
        self.outgoing_data_total +=
            (outgoing.command.size() + usize::from(outgoing.fragment_length)) as u32;

        if outgoing.command.channel_id == SYSTEM_CHANNEL_ID {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[usize::from(outgoing.command.channel_id)];
            if outgoing.command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.flags & COMMAND_FLAG_UNSEQUENCED != 0 {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.queue_time = queue_time;
        outgoing.command.reliable_sequence_number = outgoing.reliable_sequence_number;
        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        if outgoing.command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 && outgoing.packet.is_some() {
            self.outgoing_send_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_commands.push_back(outgoing);
        }
    }

    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Arc<SharedPacket>>,
        fragment_offset: u32,
        fragment_length: u16,
        queue_time: u32,
    ) {
        self.setup_outgoing_command(
            OutgoingCommand {
                command,
                fragment_offset,
                fragment_length,
                reliable_sequence_number: 0,
                unreliable_sequence_number: 0,
                sent_time: 0,
                round_trip_timeout: 0,
                queue_time: 0,
                send_attempts: 0,
                packet,
            },
            queue_time,
        );
    }

    /// Queue an acknowledgement for a received reliable command, unless its
    /// sequence number falls in the lap-boundary windows.
    pub(crate) fn queue_acknowledgement(&mut self, command: &Command, sent_time: u16) -> bool {
        if usize::from(command.channel_id) < self.channels.len() {
            let channel = &self.channels[usize::from(command.channel_id)];
            if !channel.accepts_ack(command.reliable_sequence_number) {
                return false;
            }
        }
        self.outgoing_data_total += command_size(Opcode::Acknowledge) as u32;
        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            opcode: command.opcode(),
            channel_id: command.channel_id,
            reliable_sequence_number: command.reliable_sequence_number,
        });
        true
    }

    /// Buffer a received command on its channel, keeping the channel's list
    /// ordered by (reliable, unreliable) sequence under the window shift, and
    /// run the dispatchers it may have unblocked.
    pub(crate) fn queue_incoming_command(
        &mut self,
        command: &Command,
        payload: &[u8],
        packet_flags: PacketFlags,
        fragment_count: u32,
        total_length: usize,
        maximum_waiting_data: usize,
        dispatch_queue: &mut VecDeque<usize>,
    ) -> Result<QueueOutcome, Rejected> {
        let opcode = command.opcode();
        let discard = |fragment_count: u32| {
            if fragment_count > 0 {
                Err(Rejected)
            } else {
                Ok(QueueOutcome::Discarded)
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard(fragment_count);
        }

        let channel_index = usize::from(command.channel_id);
        let reliable_sequence_number = command.reliable_sequence_number;
        if opcode != Opcode::SendUnsequenced
            && !self.channels[channel_index].accepts_sequence(reliable_sequence_number)
        {
            return discard(fragment_count);
        }

        let mut unreliable_sequence_number = 0;
        let channel = &self.channels[channel_index];
        let insert_at = match opcode {
            Opcode::SendFragment | Opcode::SendReliable => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard(fragment_count);
                }
                let current = channel.incoming_reliable_sequence_number;
                let list = &channel.incoming_reliable_commands;
                let mut i = list.len();
                loop {
                    if i == 0 {
                        break 0;
                    }
                    let entry = &list[i - 1];
                    if reliable_sequence_number >= current {
                        if entry.reliable_sequence_number < current {
                            i -= 1;
                            continue;
                        }
                    } else if entry.reliable_sequence_number >= current {
                        break i;
                    }
                    if entry.reliable_sequence_number <= reliable_sequence_number {
                        if entry.reliable_sequence_number < reliable_sequence_number {
                            break i;
                        }
                        return discard(fragment_count);
                    }
                    i -= 1;
                }
            }
            Opcode::SendUnreliable | Opcode::SendUnreliableFragment => {
                unreliable_sequence_number = match &command.body {
                    CommandBody::SendUnreliable {
                        unreliable_sequence_number,
                        ..
                    } => *unreliable_sequence_number,
                    CommandBody::SendUnreliableFragment(info) => info.start_sequence_number,
                    _ => 0,
                };
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return discard(fragment_count);
                }
                let current = channel.incoming_reliable_sequence_number;
                let list = &channel.incoming_unreliable_commands;
                let mut i = list.len();
                loop {
                    if i == 0 {
                        break 0;
                    }
                    let entry = &list[i - 1];
                    if reliable_sequence_number >= current {
                        if entry.reliable_sequence_number < current {
                            i -= 1;
                            continue;
                        }
                    } else if entry.reliable_sequence_number >= current {
                        break i;
                    }
                    if entry.reliable_sequence_number < reliable_sequence_number {
                        break i;
                    }
                    if entry.reliable_sequence_number > reliable_sequence_number {
                        i -= 1;
                        continue;
                    }
                    if entry.unreliable_sequence_number <= unreliable_sequence_number {
                        if entry.unreliable_sequence_number < unreliable_sequence_number {
                            break i;
                        }
                        return discard(fragment_count);
                    }
                    i -= 1;
                }
            }
            Opcode::SendUnsequenced => channel.incoming_unreliable_commands.len(),
            _ => return discard(fragment_count),
        };

        if self.total_waiting_data >= maximum_waiting_data {
            trace!(
                waiting = self.total_waiting_data,
                "incoming packet exceeds waiting-data ceiling"
            );
            return Err(Rejected);
        }

        let data = if fragment_count > 0 {
            BytesMut::zeroed(total_length)
        } else {
            BytesMut::from(payload)
        };
        let fragments = if fragment_count > 0 {
            Some(vec![0u32; ((fragment_count + 31) / 32) as usize].into_boxed_slice())
        } else {
            None
        };

        self.total_waiting_data += data.len();

        let incoming = IncomingCommand {
            opcode,
            channel_id: command.channel_id,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            data,
            packet_flags,
        };

        let channel = &mut self.channels[channel_index];
        match opcode {
            Opcode::SendFragment | Opcode::SendReliable => {
                channel.incoming_reliable_commands.insert(insert_at, incoming);
                self.dispatch_incoming_reliable_commands(channel_index, dispatch_queue);
            }
            _ => {
                channel
                    .incoming_unreliable_commands
                    .insert(insert_at, incoming);
                self.dispatch_incoming_unreliable_commands(channel_index, dispatch_queue);
            }
        }

        Ok(QueueOutcome::Queued)
    }

    /// Move the contiguous, fully reassembled prefix of the reliable list to
    /// the dispatched queue.
    pub(crate) fn dispatch_incoming_reliable_commands(
        &mut self,
        channel_index: usize,
        dispatch_queue: &mut VecDeque<usize>,
    ) {
        let channel = &mut self.channels[channel_index];
        let mut ready = 0;
        while ready < channel.incoming_reliable_commands.len() {
            let command = &channel.incoming_reliable_commands[ready];
            if command.fragments_remaining > 0
                || command.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }
            channel.incoming_reliable_sequence_number = command.reliable_sequence_number;
            if command.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add((command.fragment_count - 1) as u16);
            }
            ready += 1;
        }
        if ready == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;
        self.dispatched_commands
            .extend(self.channels[channel_index].incoming_reliable_commands.drain(..ready));
        self.mark_needs_dispatch(dispatch_queue);

        if !self.channels[channel_index]
            .incoming_unreliable_commands
            .is_empty()
        {
            self.dispatch_incoming_unreliable_commands(channel_index, dispatch_queue);
        }
    }

    /// Deliver unreliable commands inside the current reliable window, drop
    /// the ones the window has moved past, and leave future ones waiting.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        channel_index: usize,
        dispatch_queue: &mut VecDeque<usize>,
    ) {
        let mut delivered = false;
        let mut index = 0;
        loop {
            let channel = &mut self.channels[channel_index];
            let Some(command) = channel.incoming_unreliable_commands.get(index) else {
                break;
            };
            if command.opcode == Opcode::SendUnsequenced {
                let command = channel.incoming_unreliable_commands.remove(index).unwrap();
                self.dispatched_commands.push_back(command);
                delivered = true;
                continue;
            }
            if command.reliable_sequence_number == channel.incoming_reliable_sequence_number {
                if command.fragments_remaining == 0 {
                    channel.incoming_unreliable_sequence_number =
                        command.unreliable_sequence_number;
                    let command = channel.incoming_unreliable_commands.remove(index).unwrap();
                    self.dispatched_commands.push_back(command);
                    delivered = true;
                } else {
                    // A fragment set still assembling at the current sequence;
                    // later commands may still be deliverable past it.
                    index += 1;
                }
                continue;
            }
            let window = channel.shifted_window(command.reliable_sequence_number);
            let current = channel.current_window();
            if window >= current && window < current + FREE_RELIABLE_WINDOWS - 1 {
                // A future reliable window: everything from here on waits.
                break;
            }
            let dropped = channel.incoming_unreliable_commands.remove(index).unwrap();
            trace!(
                channel = channel_index,
                sequence = dropped.reliable_sequence_number,
                "dropping unreliable command behind the reliable window"
            );
            self.total_waiting_data = self.total_waiting_data.saturating_sub(dropped.data.len());
        }
        if delivered {
            self.mark_needs_dispatch(dispatch_queue);
        }
    }

    pub(crate) fn mark_needs_dispatch(&mut self, dispatch_queue: &mut VecDeque<usize>) {
        if self.flags & PEER_FLAG_NEEDS_DISPATCH == 0 {
            dispatch_queue.push_back(usize::from(self.incoming_peer_id));
            self.flags |= PEER_FLAG_NEEDS_DISPATCH;
        }
    }

    /// Pop the next fully sequenced packet for the application.
    pub(crate) fn receive_dispatched(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;
        self.total_waiting_data = self.total_waiting_data.saturating_sub(command.data.len());
        Some((
            command.channel_id,
            Packet::new(command.data.freeze(), command.packet_flags),
        ))
    }

    /// Adjust the packet throttle from one round-trip-time sample.
    pub(crate) fn throttle(&mut self, round_trip_time: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if round_trip_time <= self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if round_trip_time
            > self.last_round_trip_time + 2 * self.last_round_trip_time_variance
        {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }
        0
    }

    /// Fold one RTT sample into the smoothed estimate, refresh the throttle,
    /// and promote the epoch extremes when the throttle interval rolls over.
    pub(crate) fn track_round_trip_time(&mut self, service_time: u32, round_trip_time: u32) {
        if self.last_receive_time > 0 {
            self.throttle(round_trip_time);
            self.round_trip_time_variance -= self.round_trip_time_variance / 4;
            if round_trip_time >= self.round_trip_time {
                let diff = round_trip_time - self.round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time -= diff / 8;
            }
        } else {
            self.round_trip_time = round_trip_time;
            self.round_trip_time_variance = (round_trip_time + 1) / 2;
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }
        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }

        if self.packet_throttle_epoch == 0
            || time_difference(service_time, self.packet_throttle_epoch)
                >= self.packet_throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = service_time;
        }

        self.last_receive_time = service_time.max(1);
        self.earliest_timeout = 0;
    }

    /// Take a previously queued or transmitted reliable command out of the
    /// retransmission machinery, releasing its window slot. Returns the
    /// opcode of the removed command and whether it had been transmitted.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<(Opcode, bool)> {
        enum Source {
            Sent,
            Outgoing,
            OutgoingSendReliable,
        }

        let located = self
            .sent_reliable_commands
            .iter()
            .position(|command| {
                command.reliable_sequence_number == reliable_sequence_number
                    && command.command.channel_id == channel_id
            })
            .map(|i| (Source::Sent, i))
            .or_else(|| {
                find_unsent_reliable(&self.outgoing_commands, reliable_sequence_number, channel_id)
                    .map(|i| (Source::Outgoing, i))
            })
            .or_else(|| {
                find_unsent_reliable(
                    &self.outgoing_send_reliable_commands,
                    reliable_sequence_number,
                    channel_id,
                )
                .map(|i| (Source::OutgoingSendReliable, i))
            });
        let (source, index) = located?;
        let was_sent = matches!(source, Source::Sent);

        if usize::from(channel_id) < self.channels.len() {
            let channel = &mut self.channels[usize::from(channel_id)];
            let window = usize::from(reliable_sequence_number / RELIABLE_WINDOW_SIZE);
            if channel.reliable_windows[window] > 0 {
                channel.reliable_windows[window] -= 1;
                if channel.reliable_windows[window] == 0 {
                    channel.used_reliable_windows &= !(1 << window);
                }
            }
        }

        let command = match source {
            Source::Sent => self.sent_reliable_commands.remove(index).unwrap(),
            Source::Outgoing => self.outgoing_commands.remove(index).unwrap(),
            Source::OutgoingSendReliable => {
                self.outgoing_send_reliable_commands.remove(index).unwrap()
            }
        };

        let opcode = command.command.opcode();
        if let Some(packet) = command.packet {
            if was_sent {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(u32::from(command.fragment_length));
            }
            crate::packet::retire(packet, true);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some((opcode, was_sent))
    }
}

fn find_unsent_reliable(
    queue: &VecDeque<OutgoingCommand>,
    reliable_sequence_number: u16,
    channel_id: u8,
) -> Option<usize> {
    for (i, command) in queue.iter().enumerate() {
        if command.command.flags & COMMAND_FLAG_ACKNOWLEDGE == 0 {
            continue;
        }
        if command.send_attempts < 1 {
            return None;
        }
        if command.reliable_sequence_number == reliable_sequence_number
            && command.command.channel_id == channel_id
        {
            return Some(i);
        }
    }
    None
}

impl Peer {
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Mean round trip time in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    pub fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Mean packet loss, expressed in fractions of [`packet_loss_scale`].
    ///
    /// [`packet_loss_scale`]: Peer::packet_loss_scale
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    pub fn packet_loss_scale() -> u32 {
        PEER_PACKET_LOSS_SCALE
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Bytes of received packets buffered and not yet claimed by the
    /// application.
    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(0, 1392);
        peer.state = PeerState::Connected;
        peer.channels = (0..channels).map(|_| Channel::new()).collect();
        peer
    }

    fn reliable_send(sequence: u16, payload: &[u8]) -> Command {
        Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: sequence,
            body: CommandBody::SendReliable {
                data_length: payload.len() as u16,
            },
        }
    }

    #[test]
    fn reliable_commands_dispatch_in_sequence() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();

        // Out of order: 2 buffers, then 1 releases both.
        assert_eq!(
            peer.queue_incoming_command(
                &reliable_send(2, b"two"),
                b"two",
                PacketFlags::RELIABLE,
                0,
                3,
                usize::MAX,
                &mut dispatch,
            ),
            Ok(QueueOutcome::Queued)
        );
        assert!(peer.dispatched_commands.is_empty());
        assert_eq!(
            peer.queue_incoming_command(
                &reliable_send(1, b"one"),
                b"one",
                PacketFlags::RELIABLE,
                0,
                3,
                usize::MAX,
                &mut dispatch,
            ),
            Ok(QueueOutcome::Queued)
        );
        let (channel, first) = peer.receive_dispatched().unwrap();
        assert_eq!(channel, 0);
        assert_eq!(first.data(), b"one");
        assert_eq!(peer.receive_dispatched().unwrap().1.data(), b"two");
        assert_eq!(dispatch.len(), 1);
    }

    #[test]
    fn duplicate_reliable_commands_are_discarded() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();
        for _ in 0..2 {
            peer.queue_incoming_command(
                &reliable_send(1, b"x"),
                b"x",
                PacketFlags::RELIABLE,
                0,
                1,
                usize::MAX,
                &mut dispatch,
            )
            .unwrap();
        }
        // Redelivery of the last-dispatched sequence number is also refused.
        assert_eq!(
            peer.queue_incoming_command(
                &reliable_send(1, b"x"),
                b"x",
                PacketFlags::RELIABLE,
                0,
                1,
                usize::MAX,
                &mut dispatch,
            ),
            Ok(QueueOutcome::Discarded)
        );
        assert_eq!(peer.dispatched_commands.len(), 1);
    }

    #[test]
    fn waiting_data_ceiling_rejects() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();
        peer.queue_incoming_command(
            &reliable_send(1, b"abcd"),
            b"abcd",
            PacketFlags::RELIABLE,
            0,
            4,
            usize::MAX,
            &mut dispatch,
        )
        .unwrap();
        assert_eq!(
            peer.queue_incoming_command(
                &reliable_send(2, b"efgh"),
                b"efgh",
                PacketFlags::RELIABLE,
                0,
                4,
                4,
                &mut dispatch,
            ),
            Err(Rejected)
        );
    }

    #[test]
    fn throttle_tracks_rtt_signal() {
        let mut peer = connected_peer(1);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 16;
        assert_eq!(peer.throttle(90), 1);
        assert_eq!(peer.packet_throttle, 18);
        assert_eq!(peer.throttle(200), -1);
        assert_eq!(peer.packet_throttle, 16);
        // Inside the variance band: no change.
        assert_eq!(peer.throttle(110), 0);
        assert_eq!(peer.packet_throttle, 16);
        // Indistinct signal clamps to the limit.
        peer.last_round_trip_time_variance = 200;
        peer.packet_throttle_limit = 20;
        assert_eq!(peer.throttle(90), 0);
        assert_eq!(peer.packet_throttle, 20);
    }

    #[test]
    fn rtt_smoothing_seeds_then_converges() {
        let mut peer = connected_peer(1);
        peer.track_round_trip_time(1000, 100);
        assert_eq!(peer.round_trip_time, 100);
        assert_eq!(peer.round_trip_time_variance, 50);
        let before = peer.round_trip_time;
        peer.track_round_trip_time(1100, 200);
        assert!(peer.round_trip_time > before);
        assert!(peer.round_trip_time < 200);
    }
}
