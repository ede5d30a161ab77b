//! Datagram parsing and the per-command receive handlers.
//!
//! Malformed input never unwinds: a bad header drops the datagram, a bad
//! command drops the rest of the datagram. Only fatal socket errors surface
//! to the caller.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::trace;

use super::{is_established, negotiated_window_size, Host, PeerId};
use crate::packet::PacketFlags;
use crate::peer::{
    Channel, PeerState, PEER_FREE_UNSEQUENCED_WINDOWS, PEER_UNSEQUENCED_WINDOW_SIZE,
};
use crate::protocol::{
    Command, CommandBody, ConnectParams, Opcode, BASE_HEADER_SIZE, CHECKSUM_SIZE,
    COMMAND_FLAG_ACKNOWLEDGE, FULL_HEADER_SIZE, HEADER_FLAG_COMPRESSED, HEADER_FLAG_MASK,
    HEADER_FLAG_SENT_TIME, HEADER_SESSION_MASK, HEADER_SESSION_SHIFT, MAXIMUM_CHANNEL_COUNT,
    MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT,
    MINIMUM_MTU, MINIMUM_WINDOW_SIZE, SYSTEM_CHANNEL_ID,
};
use crate::socket::Socket;
use crate::timing;

/// A command handler failed; the rest of the datagram is abandoned.
struct CommandError;

type CommandResult = Result<(), CommandError>;

impl<S: Socket> Host<S> {
    pub(super) fn receive_incoming_commands(&mut self) -> io::Result<()> {
        let mut buffer = [0u8; MAXIMUM_MTU as usize];
        for _ in 0..256 {
            let (length, address) = match self.socket.recv(&mut buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error),
            };
            self.total_received_data += length as u64;
            self.total_received_packets += 1;
            self.handle_datagram(&buffer[..length], address);
        }
        Ok(())
    }

    fn handle_datagram(&mut self, data: &[u8], address: SocketAddr) {
        if data.len() < BASE_HEADER_SIZE {
            return;
        }
        let word = u16::from_be_bytes([data[0], data[1]]);
        let session = ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let header_flags = word & HEADER_FLAG_MASK;
        let peer_id = word & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);

        let mut header_size = if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            FULL_HEADER_SIZE
        } else {
            BASE_HEADER_SIZE
        };
        if self.checksum.is_some() {
            header_size += CHECKSUM_SIZE;
        }
        if data.len() < header_size {
            return;
        }
        let sent_time = if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            u16::from_be_bytes([data[2], data[3]])
        } else {
            0
        };

        let peer_index = if peer_id == MAXIMUM_PEER_ID {
            None
        } else {
            let index = usize::from(peer_id);
            if index >= self.peers.len() {
                return;
            }
            let peer = &self.peers[index];
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                return;
            }
            if peer.address != Some(address) {
                return;
            }
            if peer.outgoing_peer_id < MAXIMUM_PEER_ID && session != peer.incoming_session_id {
                trace!(peer = index, session, "datagram from a stale session");
                return;
            }
            Some(index)
        };

        if let Some(checksum) = &self.checksum {
            let slot = header_size - CHECKSUM_SIZE;
            let desired = u32::from_be_bytes([
                data[slot],
                data[slot + 1],
                data[slot + 2],
                data[slot + 3],
            ]);
            let connect_id = peer_index.map_or(0, |index| self.peers[index].connect_id);
            let mut scratch = data.to_vec();
            scratch[slot..slot + 4].copy_from_slice(&connect_id.to_be_bytes());
            if checksum.checksum(&scratch) != desired {
                trace!("datagram failed checksum");
                return;
            }
        }

        let commands = if header_flags & HEADER_FLAG_COMPRESSED != 0 {
            let Some(compressor) = self.compressor.as_mut() else {
                return;
            };
            let mut decompressed = vec![0u8; MAXIMUM_MTU as usize];
            let Some(size) = compressor.decompress(&data[header_size..], &mut decompressed) else {
                trace!("datagram failed to decompress");
                return;
            };
            decompressed.truncate(size);
            Bytes::from(decompressed)
        } else {
            Bytes::copy_from_slice(&data[header_size..])
        };

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(address);
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(data.len() as u32);
        }

        let mut commands = commands;
        let mut current_peer = peer_index;
        while !commands.is_empty() {
            let (command, payload) = match Command::decode(&mut commands) {
                Ok(decoded) => decoded,
                Err(error) => {
                    trace!(%error, "dropping rest of datagram");
                    break;
                }
            };
            let opcode = command.opcode();

            let handled = match current_peer {
                None if opcode == Opcode::Connect => match self.handle_connect(address, &command) {
                    Some(index) => {
                        current_peer = Some(index);
                        Ok(())
                    }
                    None => Err(CommandError),
                },
                None => Err(CommandError),
                Some(index) => self.handle_command(index, &command, &payload),
            };
            if handled.is_err() {
                break;
            }

            let Some(index) = current_peer else {
                continue;
            };
            if command.flags & COMMAND_FLAG_ACKNOWLEDGE == 0 {
                continue;
            }
            if header_flags & HEADER_FLAG_SENT_TIME == 0 {
                break;
            }
            match self.peers[index].state {
                PeerState::Disconnecting
                | PeerState::AcknowledgingConnect
                | PeerState::Disconnected
                | PeerState::Zombie => {}
                PeerState::AcknowledgingDisconnect => {
                    if opcode == Opcode::Disconnect {
                        self.peers[index].queue_acknowledgement(&command, sent_time);
                    }
                }
                _ => {
                    self.peers[index].queue_acknowledgement(&command, sent_time);
                }
            }
        }
    }

    fn handle_command(&mut self, index: usize, command: &Command, payload: &Bytes) -> CommandResult {
        match &command.body {
            CommandBody::Acknowledge { .. } => self.handle_acknowledge(index, command),
            CommandBody::VerifyConnect { params } => self.handle_verify_connect(index, *params),
            CommandBody::Disconnect { data } => self.handle_disconnect(index, command, *data),
            CommandBody::Ping => self.handle_ping(index),
            CommandBody::SendReliable { .. } => {
                self.handle_send(index, command, payload, PacketFlags::RELIABLE)
            }
            CommandBody::SendUnreliable { .. } => {
                self.handle_send(index, command, payload, PacketFlags::default())
            }
            CommandBody::SendUnsequenced { .. } => {
                self.handle_send_unsequenced(index, command, payload)
            }
            CommandBody::SendFragment(_) => self.handle_send_fragment(index, command, payload),
            CommandBody::SendUnreliableFragment(_) => {
                self.handle_send_unreliable_fragment(index, command, payload)
            }
            CommandBody::BandwidthLimit { .. } => self.handle_bandwidth_limit(index, command),
            CommandBody::ThrottleConfigure { .. } => self.handle_throttle_configure(index, command),
            // A connect for an already-known peer.
            CommandBody::Connect { .. } => Err(CommandError),
        }
    }

    fn handle_acknowledge(&mut self, index: usize, command: &Command) -> CommandResult {
        if matches!(
            self.peers[index].state,
            PeerState::Disconnected | PeerState::Zombie
        ) {
            return Ok(());
        }
        let CommandBody::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.body
        else {
            return Err(CommandError);
        };

        // Reconstruct the full 32-bit send time from its 16 wire bits.
        let mut received_sent_time = u32::from(received_sent_time);
        received_sent_time |= self.service_time & 0xFFFF_0000;
        if (received_sent_time & 0x8000) > (self.service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }
        if timing::time_less(self.service_time, received_sent_time) {
            return Ok(());
        }
        let round_trip_time = timing::time_difference(self.service_time, received_sent_time).max(1);
        let service_time = self.service_time;
        self.peers[index].track_round_trip_time(service_time, round_trip_time);

        let removed = self.peers[index]
            .remove_sent_reliable_command(received_reliable_sequence_number, command.channel_id)
            .map(|(opcode, _)| opcode);

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if removed != Some(Opcode::VerifyConnect) {
                    return Err(CommandError);
                }
                self.notify_connect(index);
            }
            PeerState::Disconnecting => {
                if removed != Some(Opcode::Disconnect) {
                    return Err(CommandError);
                }
                self.notify_disconnect(index, false);
            }
            PeerState::DisconnectLater => {
                if !self.peers[index].has_outgoing_commands() {
                    let data = self.peers[index].event_data;
                    self.disconnect(PeerId(index), data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_connect(&mut self, address: SocketAddr, command: &Command) -> Option<usize> {
        let CommandBody::Connect { params, data } = command.body else {
            return None;
        };
        let channel_count = params.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }
        let channel_count = channel_count.min(self.channel_limit);

        let mut slot = None;
        let mut duplicate_count = 0usize;
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(i);
                }
            } else if peer.state != PeerState::Connecting {
                if let Some(peer_address) = peer.address {
                    if peer_address.ip() == address.ip() {
                        if peer_address.port() == address.port()
                            && peer.connect_id == params.connect_id
                        {
                            return None;
                        }
                        duplicate_count += 1;
                    }
                }
            }
        }
        let index = slot?;
        if duplicate_count >= self.duplicate_peers {
            trace!(%address, "refusing connect: too many peers from this address");
            return None;
        }

        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let host_mtu = self.mtu;

        let verify = {
            let peer = &mut self.peers[index];
            peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
            peer.state = PeerState::AcknowledgingConnect;
            peer.connect_id = params.connect_id;
            peer.address = Some(address);
            peer.mtu = host_mtu;
            peer.outgoing_peer_id = params.outgoing_peer_id;
            peer.incoming_bandwidth = params.incoming_bandwidth;
            peer.outgoing_bandwidth = params.outgoing_bandwidth;
            peer.packet_throttle_interval = params.packet_throttle_interval;
            peer.packet_throttle_acceleration = params.packet_throttle_acceleration;
            peer.packet_throttle_deceleration = params.packet_throttle_deceleration;
            peer.event_data = data;

            // Step the session ids forward from the remote proposal, avoiding
            // a collision with the opposite direction, so datagrams from a
            // previous incarnation of this slot are recognizably stale.
            let mut incoming_session_id = if params.incoming_session_id == 0xFF {
                peer.outgoing_session_id
            } else {
                params.incoming_session_id
            };
            incoming_session_id =
                (incoming_session_id.wrapping_add(1)) & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
            if incoming_session_id == peer.outgoing_session_id {
                incoming_session_id = (incoming_session_id.wrapping_add(1)) & 3;
            }
            peer.outgoing_session_id = incoming_session_id;

            let mut outgoing_session_id = if params.outgoing_session_id == 0xFF {
                peer.incoming_session_id
            } else {
                params.outgoing_session_id
            };
            outgoing_session_id =
                (outgoing_session_id.wrapping_add(1)) & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
            if outgoing_session_id == peer.incoming_session_id {
                outgoing_session_id = (outgoing_session_id.wrapping_add(1)) & 3;
            }
            peer.incoming_session_id = outgoing_session_id;

            let mtu = params.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
            if mtu < peer.mtu {
                peer.mtu = mtu;
            }

            peer.window_size =
                negotiated_window_size(host_outgoing_bandwidth, peer.incoming_bandwidth);

            // The window offered back is bounded by our own receive budget
            // and the remote proposal.
            let mut window_size = if host_incoming_bandwidth == 0 {
                MAXIMUM_WINDOW_SIZE
            } else {
                (host_incoming_bandwidth / crate::peer::PEER_WINDOW_SIZE_SCALE)
                    * MINIMUM_WINDOW_SIZE
            };
            window_size = window_size
                .min(params.window_size)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: SYSTEM_CHANNEL_ID,
                reliable_sequence_number: 0,
                body: CommandBody::VerifyConnect {
                    params: ConnectParams {
                        outgoing_peer_id: peer.incoming_peer_id,
                        incoming_session_id: peer.outgoing_session_id,
                        outgoing_session_id: peer.incoming_session_id,
                        mtu: peer.mtu,
                        window_size,
                        channel_count: channel_count as u32,
                        incoming_bandwidth: host_incoming_bandwidth,
                        outgoing_bandwidth: host_outgoing_bandwidth,
                        packet_throttle_interval: peer.packet_throttle_interval,
                        packet_throttle_acceleration: peer.packet_throttle_acceleration,
                        packet_throttle_deceleration: peer.packet_throttle_deceleration,
                        connect_id: peer.connect_id,
                    },
                },
            }
        };
        self.queue_command(index, verify, None, 0, 0);
        trace!(peer = index, %address, "incoming connection");
        Some(index)
    }

    fn handle_verify_connect(&mut self, index: usize, params: ConnectParams) -> CommandResult {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(());
        }
        let channel_count = params.channel_count as usize;
        {
            let peer = &self.peers[index];
            if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
                || params.packet_throttle_interval != peer.packet_throttle_interval
                || params.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || params.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || params.connect_id != peer.connect_id
            {
                trace!(peer = index, "verify does not match our proposal");
                self.peers[index].event_data = 0;
                self.dispatch_state(index, PeerState::Zombie);
                return Err(CommandError);
            }
        }

        self.peers[index].remove_sent_reliable_command(1, SYSTEM_CHANNEL_ID);

        let peer = &mut self.peers[index];
        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_session_id = params.incoming_session_id;
        peer.outgoing_session_id = params.outgoing_session_id;

        let mtu = params.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }
        let window_size = params
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }
        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;

        self.notify_connect(index);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command, data: u32) -> CommandResult {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.reset_peer_queues(index);

        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                    self.change_state(index, PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(index, PeerState::Zombie);
                }
            }
            _ => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_peer(index);
            }
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }
        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> CommandResult {
        if !is_established(self.peers[index].state) {
            return Err(CommandError);
        }
        Ok(())
    }

    fn handle_bandwidth_limit(&mut self, index: usize, command: &Command) -> CommandResult {
        if !is_established(self.peers[index].state) {
            return Err(CommandError);
        }
        let CommandBody::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.body
        else {
            return Err(CommandError);
        };

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];
        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers -= 1;
        }
        peer.incoming_bandwidth = incoming_bandwidth;
        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }
        peer.outgoing_bandwidth = outgoing_bandwidth;
        peer.window_size =
            negotiated_window_size(peer.incoming_bandwidth, host_outgoing_bandwidth);
        Ok(())
    }

    fn handle_throttle_configure(&mut self, index: usize, command: &Command) -> CommandResult {
        if !is_established(self.peers[index].state) {
            return Err(CommandError);
        }
        let CommandBody::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } = command.body
        else {
            return Err(CommandError);
        };
        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = packet_throttle_interval;
        peer.packet_throttle_acceleration = packet_throttle_acceleration;
        peer.packet_throttle_deceleration = packet_throttle_deceleration;
        Ok(())
    }

    fn handle_send(
        &mut self,
        index: usize,
        command: &Command,
        payload: &Bytes,
        packet_flags: PacketFlags,
    ) -> CommandResult {
        if usize::from(command.channel_id) >= self.peers[index].channels.len()
            || !is_established(self.peers[index].state)
            || payload.len() > self.maximum_packet_size
        {
            return Err(CommandError);
        }
        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            command,
            payload,
            packet_flags,
            0,
            payload.len(),
            maximum_waiting_data,
            &mut self.dispatch_queue,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(CommandError),
        }
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        payload: &Bytes,
    ) -> CommandResult {
        if usize::from(command.channel_id) >= self.peers[index].channels.len()
            || !is_established(self.peers[index].state)
            || payload.len() > self.maximum_packet_size
        {
            return Err(CommandError);
        }
        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return Err(CommandError);
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        let mut group = u32::from(unsequenced_group);
        let window_index = group % PEER_UNSEQUENCED_WINDOW_SIZE;
        if group < u32::from(peer.incoming_unsequenced_group) {
            group += 0x10000;
        }
        if group
            >= u32::from(peer.incoming_unsequenced_group)
                + PEER_FREE_UNSEQUENCED_WINDOWS * PEER_UNSEQUENCED_WINDOW_SIZE
        {
            return Ok(());
        }
        let group = group & 0xFFFF;

        if group.wrapping_sub(window_index) != u32::from(peer.incoming_unsequenced_group) {
            peer.incoming_unsequenced_group = (group - window_index) as u16;
            peer.unsequenced_window.fill(0);
        } else if peer.unsequenced_window[(window_index / 32) as usize] & (1 << (window_index % 32))
            != 0
        {
            return Ok(());
        }

        match peer.queue_incoming_command(
            command,
            payload,
            PacketFlags::UNSEQUENCED,
            0,
            payload.len(),
            maximum_waiting_data,
            &mut self.dispatch_queue,
        ) {
            Ok(_) => {}
            Err(_) => return Err(CommandError),
        }
        self.peers[index].unsequenced_window[(window_index / 32) as usize] |=
            1 << (window_index % 32);
        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: &Bytes,
    ) -> CommandResult {
        if usize::from(command.channel_id) >= self.peers[index].channels.len()
            || !is_established(self.peers[index].state)
        {
            return Err(CommandError);
        }
        let CommandBody::SendFragment(info) = command.body else {
            return Err(CommandError);
        };
        if !valid_fragment_geometry(&info, payload.len(), self.maximum_packet_size) {
            return Err(CommandError);
        }

        let start_sequence_number = info.start_sequence_number;
        let channel_index = usize::from(command.channel_id);
        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        if !peer.channels[channel_index].accepts_sequence(start_sequence_number) {
            return Ok(());
        }

        let locate = |channel: &Channel| -> Result<Option<usize>, CommandError> {
            let current = channel.incoming_reliable_sequence_number;
            let list = &channel.incoming_reliable_commands;
            for i in (0..list.len()).rev() {
                let entry = &list[i];
                if start_sequence_number >= current {
                    if entry.reliable_sequence_number < current {
                        continue;
                    }
                } else if entry.reliable_sequence_number >= current {
                    break;
                }
                if entry.reliable_sequence_number <= start_sequence_number {
                    if entry.reliable_sequence_number < start_sequence_number {
                        break;
                    }
                    if entry.opcode != Opcode::SendFragment
                        || info.total_length as usize != entry.data.len()
                        || info.fragment_count != entry.fragment_count
                    {
                        return Err(CommandError);
                    }
                    return Ok(Some(i));
                }
            }
            Ok(None)
        };

        let mut position = locate(&peer.channels[channel_index])?;
        if position.is_none() {
            let mut start_command = command.clone();
            start_command.reliable_sequence_number = start_sequence_number;
            if peer
                .queue_incoming_command(
                    &start_command,
                    &[],
                    PacketFlags::RELIABLE,
                    info.fragment_count,
                    info.total_length as usize,
                    maximum_waiting_data,
                    &mut self.dispatch_queue,
                )
                .is_err()
            {
                return Err(CommandError);
            }
            position = locate(&peer.channels[channel_index])?;
        }
        let Some(position) = position else {
            return Ok(());
        };

        let entry = &mut peer.channels[channel_index].incoming_reliable_commands[position];
        if !entry.has_fragment(info.fragment_number) {
            entry.mark_fragment(info.fragment_number);
            entry.fragments_remaining -= 1;
            let offset = info.fragment_offset as usize;
            let length = payload.len().min(entry.data.len() - offset);
            entry.data[offset..offset + length].copy_from_slice(&payload[..length]);
            if entry.fragments_remaining == 0 {
                peer.dispatch_incoming_reliable_commands(channel_index, &mut self.dispatch_queue);
            }
        }
        Ok(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: &Bytes,
    ) -> CommandResult {
        if usize::from(command.channel_id) >= self.peers[index].channels.len()
            || !is_established(self.peers[index].state)
        {
            return Err(CommandError);
        }
        let CommandBody::SendUnreliableFragment(info) = command.body else {
            return Err(CommandError);
        };
        if !valid_fragment_geometry(&info, payload.len(), self.maximum_packet_size) {
            return Err(CommandError);
        }

        let reliable_sequence_number = command.reliable_sequence_number;
        let start_sequence_number = info.start_sequence_number;
        let channel_index = usize::from(command.channel_id);
        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        {
            let channel = &peer.channels[channel_index];
            if !channel.accepts_sequence(reliable_sequence_number) {
                return Ok(());
            }
            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return Ok(());
            }
        }

        let locate = |channel: &Channel| -> Result<Option<usize>, CommandError> {
            let current = channel.incoming_reliable_sequence_number;
            let list = &channel.incoming_unreliable_commands;
            for i in (0..list.len()).rev() {
                let entry = &list[i];
                if reliable_sequence_number >= current {
                    if entry.reliable_sequence_number < current {
                        continue;
                    }
                } else if entry.reliable_sequence_number >= current {
                    break;
                }
                if entry.reliable_sequence_number < reliable_sequence_number {
                    break;
                }
                if entry.reliable_sequence_number > reliable_sequence_number {
                    continue;
                }
                if entry.unreliable_sequence_number <= start_sequence_number {
                    if entry.unreliable_sequence_number < start_sequence_number {
                        break;
                    }
                    if entry.opcode != Opcode::SendUnreliableFragment
                        || info.total_length as usize != entry.data.len()
                        || info.fragment_count != entry.fragment_count
                    {
                        return Err(CommandError);
                    }
                    return Ok(Some(i));
                }
            }
            Ok(None)
        };

        let mut position = locate(&peer.channels[channel_index])?;
        if position.is_none() {
            if peer
                .queue_incoming_command(
                    command,
                    &[],
                    PacketFlags::UNRELIABLE_FRAGMENT,
                    info.fragment_count,
                    info.total_length as usize,
                    maximum_waiting_data,
                    &mut self.dispatch_queue,
                )
                .is_err()
            {
                return Err(CommandError);
            }
            position = locate(&peer.channels[channel_index])?;
        }
        let Some(position) = position else {
            return Ok(());
        };

        let entry = &mut peer.channels[channel_index].incoming_unreliable_commands[position];
        if !entry.has_fragment(info.fragment_number) {
            entry.mark_fragment(info.fragment_number);
            entry.fragments_remaining -= 1;
            let offset = info.fragment_offset as usize;
            let length = payload.len().min(entry.data.len() - offset);
            entry.data[offset..offset + length].copy_from_slice(&payload[..length]);
            if entry.fragments_remaining == 0 {
                peer.dispatch_incoming_unreliable_commands(channel_index, &mut self.dispatch_queue);
            }
        }
        Ok(())
    }

    fn notify_connect(&mut self, index: usize) {
        self.recalculate_bandwidth_limits = true;
        let next = if self.peers[index].state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };
        self.dispatch_state(index, next);
    }

    pub(super) fn notify_disconnect(&mut self, index: usize, preserve_event_data: bool) {
        let state = self.peers[index].state;
        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }
        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            // The connection never completed; free the slot without an event.
            self.reset_peer(index);
        } else {
            if !preserve_event_data {
                self.peers[index].event_data = 0;
            }
            self.dispatch_state(index, PeerState::Zombie);
        }
    }
}

fn valid_fragment_geometry(
    info: &crate::protocol::FragmentInfo,
    payload_length: usize,
    maximum_packet_size: usize,
) -> bool {
    payload_length > 0
        && info.fragment_count <= MAXIMUM_FRAGMENT_COUNT
        && info.fragment_number < info.fragment_count
        && info.total_length as usize <= maximum_packet_size
        && info.total_length >= info.fragment_count
        && info.fragment_offset < info.total_length
        && payload_length as u32 <= info.total_length - info.fragment_offset
}
