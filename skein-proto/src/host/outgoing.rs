//! The outgoing pipeline: per peer, per pass, at most one datagram of
//! acknowledgements and commands, assembled under the MTU and the reliable
//! windows, then optionally compressed and checksummed.

use std::io;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use super::{ping_command, Host, PeerId};
use crate::packet;
use crate::peer::channel::{wrap_guard_mask, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};
use crate::peer::{
    OutgoingCommand, PeerState, PEER_FLAG_CONTINUE_SENDING, PEER_PACKET_LOSS_INTERVAL,
    PEER_PACKET_LOSS_SCALE, PEER_PACKET_THROTTLE_COUNTER, PEER_PACKET_THROTTLE_SCALE,
};
use crate::protocol::{
    command_size, Command, CommandBody, Opcode, CHECKSUM_SIZE, COMMAND_FLAG_ACKNOWLEDGE,
    FULL_HEADER_SIZE, HEADER_FLAG_COMPRESSED, HEADER_FLAG_SENT_TIME, HEADER_SESSION_SHIFT,
    MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID, SYSTEM_CHANNEL_ID,
};
use crate::socket::Socket;
use crate::timing::{time_difference, time_greater_equal, time_less};

/// One datagram being packed for a peer.
struct DatagramBuilder {
    commands: BytesMut,
    command_count: usize,
    /// Projected datagram size, header and checksum included.
    packet_size: usize,
    header_flags: u16,
}

impl DatagramBuilder {
    fn new(header_size: usize) -> Self {
        Self {
            commands: BytesMut::new(),
            command_count: 0,
            packet_size: header_size,
            header_flags: 0,
        }
    }
}

enum Source {
    Main,
    SendReliable,
}

impl<S: Socket> Host<S> {
    pub(super) fn send_outgoing_commands(&mut self, check_for_timeouts: bool) -> io::Result<()> {
        let header_budget = FULL_HEADER_SIZE
            + if self.checksum.is_some() {
                CHECKSUM_SIZE
            } else {
                0
            };

        let mut send_pass = 0usize;
        let mut continue_sending = 0usize;
        while send_pass <= continue_sending {
            for index in 0..self.peers.len() {
                {
                    let peer = &self.peers[index];
                    if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                        || (send_pass > 0 && peer.flags & PEER_FLAG_CONTINUE_SENDING == 0)
                    {
                        continue;
                    }
                }
                self.peers[index].flags &= !PEER_FLAG_CONTINUE_SENDING;

                let mut out = DatagramBuilder::new(header_budget);
                let mut sent_unreliable = Vec::new();

                if !self.peers[index].acknowledgements.is_empty() {
                    self.send_acknowledgements(index, &mut out);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.check_timeouts(index)
                {
                    continue;
                }

                let mut can_ping = true;
                if !(self.peers[index].outgoing_commands.is_empty()
                    && self.peers[index].outgoing_send_reliable_commands.is_empty())
                {
                    can_ping = self.check_outgoing_commands(index, &mut out, &mut sent_unreliable);
                }
                if can_ping
                    && self.peers[index].state == PeerState::Connected
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && time_difference(self.service_time, self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && self.peers[index].mtu as usize - out.packet_size
                        >= command_size(Opcode::Ping)
                {
                    self.queue_command(index, ping_command(), None, 0, 0);
                    self.check_outgoing_commands(index, &mut out, &mut sent_unreliable);
                }

                if out.command_count == 0 {
                    continue;
                }

                self.refresh_packet_loss(index);

                let datagram = self.assemble_datagram(index, &out);
                let Some(address) = self.peers[index].address else {
                    continue;
                };
                match self.socket.send(address, &datagram) {
                    Ok(sent) => {
                        self.total_sent_data += sent as u64;
                        self.total_sent_packets += 1;
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        // The datagram is lost; reliable traffic recovers by
                        // retransmission. Give the socket a breather.
                        trace!(peer = index, "socket would block, ending send pass");
                        self.remove_sent_unreliable_commands(index, sent_unreliable);
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                }
                self.remove_sent_unreliable_commands(index, sent_unreliable);

                if self.peers[index].flags & PEER_FLAG_CONTINUE_SENDING != 0 {
                    continue_sending = send_pass + 1;
                }
            }
            send_pass += 1;
        }
        Ok(())
    }

    fn send_acknowledgements(&mut self, index: usize, out: &mut DatagramBuilder) {
        loop {
            let peer = &mut self.peers[index];
            if peer.acknowledgements.is_empty() {
                break;
            }
            let size = command_size(Opcode::Acknowledge);
            if out.command_count >= MAXIMUM_PACKET_COMMANDS
                || peer.mtu as usize - out.packet_size < size
            {
                peer.flags |= PEER_FLAG_CONTINUE_SENDING;
                break;
            }
            let acknowledgement = peer.acknowledgements.pop_front().unwrap();
            Command {
                flags: 0,
                channel_id: acknowledgement.channel_id,
                reliable_sequence_number: acknowledgement.reliable_sequence_number,
                body: CommandBody::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            }
            .encode(&mut out.commands);
            out.command_count += 1;
            out.packet_size += size;

            if acknowledgement.opcode == Opcode::Disconnect {
                self.dispatch_state(index, PeerState::Zombie);
            }
        }
    }

    /// Sweep `sent_reliable_commands` for retransmission deadlines. Returns
    /// true when the peer has exhausted its timeout allowance and was
    /// dispatched as a zombie.
    fn check_timeouts(&mut self, index: usize) -> bool {
        let service_time = self.service_time;
        let mut requeue_main = Vec::new();
        let mut requeue_send_reliable = Vec::new();
        let mut timed_out_peer = false;

        {
            let peer = &mut self.peers[index];
            let mut i = 0;
            while i < peer.sent_reliable_commands.len() {
                let (sent_time, round_trip_timeout, send_attempts) = {
                    let command = &peer.sent_reliable_commands[i];
                    (
                        command.sent_time,
                        command.round_trip_timeout,
                        command.send_attempts,
                    )
                };
                if time_difference(service_time, sent_time) < round_trip_timeout {
                    i += 1;
                    continue;
                }

                if peer.earliest_timeout == 0 || time_less(sent_time, peer.earliest_timeout) {
                    peer.earliest_timeout = sent_time;
                }
                let stalled_for = time_difference(service_time, peer.earliest_timeout);
                if stalled_for >= peer.timeout_maximum
                    || (u32::from(send_attempts) >= peer.timeout_limit
                        && stalled_for >= peer.timeout_minimum)
                {
                    timed_out_peer = true;
                    break;
                }

                let mut command = peer.sent_reliable_commands.remove(i).unwrap();
                peer.packets_lost += 1;
                command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);
                trace!(
                    peer = index,
                    sequence = command.reliable_sequence_number,
                    attempts = command.send_attempts,
                    "reliable command timed out, requeueing"
                );
                if command.packet.is_some() {
                    peer.reliable_data_in_transit = peer
                        .reliable_data_in_transit
                        .saturating_sub(u32::from(command.fragment_length));
                    requeue_send_reliable.push(command);
                } else {
                    requeue_main.push(command);
                }
            }

            for command in requeue_send_reliable.into_iter().rev() {
                peer.outgoing_send_reliable_commands.push_front(command);
            }
            for command in requeue_main.into_iter().rev() {
                peer.outgoing_commands.push_front(command);
            }
            if let Some(front) = peer.sent_reliable_commands.front() {
                peer.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
            }
        }

        if timed_out_peer {
            debug!(peer = index, "peer timed out");
            self.notify_disconnect(index, true);
            return true;
        }
        false
    }

    /// Merge the two outgoing queues in submission order into the datagram,
    /// honoring the reliable windows, the in-transit budget, and the
    /// unreliable throttle. Returns whether a ping could still be packed (no
    /// reliable traffic was).
    fn check_outgoing_commands(
        &mut self,
        index: usize,
        out: &mut DatagramBuilder,
        sent_unreliable: &mut Vec<OutgoingCommand>,
    ) -> bool {
        let service_time = self.service_time;
        let mut window_exceeded = false;
        let mut window_wrap = false;
        let mut can_ping = true;
        let mut main_cursor = 0usize;
        let mut reliable_cursor = 0usize;

        loop {
            let source = {
                let peer = &self.peers[index];
                let main = peer.outgoing_commands.get(main_cursor);
                let send_reliable = peer.outgoing_send_reliable_commands.get(reliable_cursor);
                match (main, send_reliable) {
                    (None, None) => break,
                    (Some(_), None) => Source::Main,
                    (None, Some(_)) => Source::SendReliable,
                    (Some(main), Some(send_reliable)) => {
                        if time_less(send_reliable.queue_time, main.queue_time) {
                            Source::SendReliable
                        } else {
                            Source::Main
                        }
                    }
                }
            };

            let (flags, channel_id, sequence, opcode, has_packet, fragment_length, send_attempts) = {
                let peer = &self.peers[index];
                let command = match source {
                    Source::Main => &peer.outgoing_commands[main_cursor],
                    Source::SendReliable => {
                        &peer.outgoing_send_reliable_commands[reliable_cursor]
                    }
                };
                (
                    command.command.flags,
                    command.command.channel_id,
                    command.reliable_sequence_number,
                    command.command.opcode(),
                    command.packet.is_some(),
                    command.fragment_length,
                    command.send_attempts,
                )
            };
            let reliable = flags & COMMAND_FLAG_ACKNOWLEDGE != 0;

            if reliable {
                let peer = &self.peers[index];
                let has_channel = channel_id != SYSTEM_CHANNEL_ID
                    && usize::from(channel_id) < peer.channels.len();
                let window = sequence / RELIABLE_WINDOW_SIZE;
                if has_channel {
                    let channel = &peer.channels[usize::from(channel_id)];
                    if !window_wrap
                        && send_attempts < 1
                        && sequence % RELIABLE_WINDOW_SIZE == 0
                        && (channel.reliable_windows
                            [usize::from((window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS)]
                            >= RELIABLE_WINDOW_SIZE
                            || channel.used_reliable_windows & wrap_guard_mask(window) != 0)
                    {
                        window_wrap = true;
                    }
                    if window_wrap {
                        match source {
                            Source::Main => main_cursor += 1,
                            Source::SendReliable => reliable_cursor += 1,
                        }
                        continue;
                    }
                }
                if has_packet {
                    if !window_exceeded {
                        let window_size = (peer.packet_throttle * peer.window_size)
                            / PEER_PACKET_THROTTLE_SCALE;
                        if peer.reliable_data_in_transit + u32::from(fragment_length)
                            > window_size.max(peer.mtu)
                        {
                            window_exceeded = true;
                        }
                    }
                    if window_exceeded {
                        match source {
                            Source::Main => main_cursor += 1,
                            Source::SendReliable => reliable_cursor += 1,
                        }
                        continue;
                    }
                }
                can_ping = false;
            }

            let size = command_size(opcode);
            let mtu = self.peers[index].mtu as usize;
            let room = mtu - out.packet_size;
            if out.command_count >= MAXIMUM_PACKET_COMMANDS
                || room < size
                || (has_packet && room < size + usize::from(fragment_length))
            {
                self.peers[index].flags |= PEER_FLAG_CONTINUE_SENDING;
                break;
            }

            let mut command = match source {
                Source::Main => self.peers[index].outgoing_commands.remove(main_cursor).unwrap(),
                Source::SendReliable => self.peers[index]
                    .outgoing_send_reliable_commands
                    .remove(reliable_cursor)
                    .unwrap(),
            };

            if reliable {
                let peer = &mut self.peers[index];
                if channel_id != SYSTEM_CHANNEL_ID
                    && usize::from(channel_id) < peer.channels.len()
                    && command.send_attempts < 1
                {
                    let window = usize::from(command.reliable_sequence_number / RELIABLE_WINDOW_SIZE);
                    let channel = &mut peer.channels[usize::from(channel_id)];
                    channel.used_reliable_windows |= 1 << window;
                    channel.reliable_windows[window] += 1;
                }
                command.send_attempts += 1;
                if command.round_trip_timeout == 0 {
                    command.round_trip_timeout =
                        peer.round_trip_time + 4 * peer.round_trip_time_variance;
                }
                if peer.sent_reliable_commands.is_empty() {
                    peer.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
                }
                command.sent_time = service_time;
                out.header_flags |= HEADER_FLAG_SENT_TIME;
                peer.reliable_data_in_transit += u32::from(command.fragment_length);
                peer.packets_sent += 1;

                command.command.encode(&mut out.commands);
                out.command_count += 1;
                out.packet_size += size;
                if let Some(packet) = &command.packet {
                    let offset = command.fragment_offset as usize;
                    out.commands.extend_from_slice(
                        &packet.data()[offset..offset + usize::from(command.fragment_length)],
                    );
                    out.packet_size += usize::from(command.fragment_length);
                }
                self.peers[index].sent_reliable_commands.push_back(command);
            } else {
                if has_packet && command.fragment_offset == 0 {
                    let peer = &mut self.peers[index];
                    peer.packet_throttle_counter += PEER_PACKET_THROTTLE_COUNTER;
                    peer.packet_throttle_counter %= PEER_PACKET_THROTTLE_SCALE;
                    if peer.packet_throttle_counter > peer.packet_throttle {
                        // Drop the packet and every queued fragment of it.
                        let dropped_reliable = command.reliable_sequence_number;
                        let dropped_unreliable = command.unreliable_sequence_number;
                        if let Some(packet) = command.packet.take() {
                            packet::retire(packet, false);
                        }
                        while let Some(next) = peer.outgoing_commands.get(main_cursor) {
                            if next.reliable_sequence_number != dropped_reliable
                                || next.unreliable_sequence_number != dropped_unreliable
                            {
                                break;
                            }
                            let mut next =
                                peer.outgoing_commands.remove(main_cursor).unwrap();
                            if let Some(packet) = next.packet.take() {
                                packet::retire(packet, false);
                            }
                        }
                        continue;
                    }
                }

                command.command.encode(&mut out.commands);
                out.command_count += 1;
                out.packet_size += size;
                if let Some(packet) = &command.packet {
                    let offset = command.fragment_offset as usize;
                    out.commands.extend_from_slice(
                        &packet.data()[offset..offset + usize::from(command.fragment_length)],
                    );
                    out.packet_size += usize::from(command.fragment_length);
                    sent_unreliable.push(command);
                }
            }
        }

        can_ping
    }

    fn remove_sent_unreliable_commands(
        &mut self,
        index: usize,
        sent_unreliable: Vec<OutgoingCommand>,
    ) {
        if sent_unreliable.is_empty() {
            return;
        }
        for mut command in sent_unreliable {
            if let Some(packet) = command.packet.take() {
                packet::retire(packet, true);
            }
        }
        if self.peers[index].state == PeerState::DisconnectLater
            && !self.peers[index].has_outgoing_commands()
        {
            let data = self.peers[index].event_data;
            self.disconnect(PeerId(index), data);
        }
    }

    fn refresh_packet_loss(&mut self, index: usize) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = service_time;
        } else if time_difference(service_time, peer.packet_loss_epoch)
            >= PEER_PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss = peer.packets_lost * PEER_PACKET_LOSS_SCALE / peer.packets_sent;
            peer.packet_loss_variance =
                (peer.packet_loss_variance * 3 + packet_loss.abs_diff(peer.packet_loss)) / 4;
            peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;
            peer.packet_loss_epoch = service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }

    fn assemble_datagram(&mut self, index: usize, out: &DatagramBuilder) -> BytesMut {
        let mut header_flags = out.header_flags;

        let compressed: Option<Vec<u8>> = self.compressor.as_mut().and_then(|compressor| {
            let mut buffer = vec![0u8; out.commands.len()];
            let size = compressor.compress(&out.commands, &mut buffer)?;
            if size < out.commands.len() {
                buffer.truncate(size);
                Some(buffer)
            } else {
                None
            }
        });
        if compressed.is_some() {
            header_flags |= HEADER_FLAG_COMPRESSED;
        }
        let payload: &[u8] = compressed.as_deref().unwrap_or(&out.commands);

        let peer = &self.peers[index];
        if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
            header_flags |= u16::from(peer.outgoing_session_id) << HEADER_SESSION_SHIFT;
        }

        let mut datagram =
            BytesMut::with_capacity(FULL_HEADER_SIZE + CHECKSUM_SIZE + payload.len());
        datagram.put_u16(peer.outgoing_peer_id | header_flags);
        if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            datagram.put_u16(self.service_time as u16);
        }
        let checksum_slot = self.checksum.is_some().then(|| {
            let connect_id = if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
                peer.connect_id
            } else {
                0
            };
            let slot = datagram.len();
            datagram.put_u32(connect_id);
            slot
        });
        datagram.extend_from_slice(payload);
        if let (Some(slot), Some(checksum)) = (checksum_slot, &self.checksum) {
            let digest = checksum.checksum(&datagram);
            datagram[slot..slot + 4].copy_from_slice(&digest.to_be_bytes());
        }
        datagram
    }
}
