//! The host: a single UDP endpoint multiplexing up to 4095 peers.
//!
//! The host owns every peer slot and performs no I/O beyond the injected
//! [`Socket`]. Peers are addressed by [`PeerId`] handles; the slot index is
//! also the wire-level peer ID the remote side addresses us by.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::trace;

use crate::config::{
    Checksum, Compressor, HostConfig, HOST_BANDWIDTH_THROTTLE_INTERVAL,
};
use crate::packet::{Packet, PacketFlags, SharedPacket};
use crate::peer::{
    Channel, Peer, PeerState, PEER_FLAG_NEEDS_DISPATCH, PEER_PACKET_THROTTLE_SCALE,
    PEER_PING_INTERVAL, PEER_TIMEOUT_LIMIT, PEER_TIMEOUT_MAXIMUM, PEER_TIMEOUT_MINIMUM,
    PEER_WINDOW_SIZE_SCALE,
};
use crate::protocol::{
    command_size, Command, CommandBody, ConnectParams, FragmentInfo, Opcode, CHECKSUM_SIZE,
    COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED, MAXIMUM_CHANNEL_COUNT,
    MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT,
    MINIMUM_WINDOW_SIZE, SYSTEM_CHANNEL_ID,
};
use crate::socket::Socket;
use crate::timing::{self, Clock, SteadyClock};

mod incoming;
mod outgoing;

/// Handle addressing a peer slot on a particular host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeerId(pub usize);

/// Something that happened on a host, surfaced by [`Host::service`] one at a
/// time.
#[derive(Debug)]
pub enum Event {
    /// A connection completed, locally or remotely initiated. `data` is the
    /// remote side's user datum for incoming connections.
    Connect { peer: PeerId, data: u32 },
    /// A connection ended; the slot is free again once this is returned.
    Disconnect { peer: PeerId, data: u32 },
    /// A fully sequenced packet is ready.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("peer count must be between 1 and {}", MAXIMUM_PEER_ID)]
    InvalidPeerCount,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConnectError {
    #[error("no peer slot available")]
    NoFreeSlots,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("channel id is out of range")]
    InvalidChannel,
    #[error("packet exceeds the maximum packet size")]
    PacketTooLarge,
    #[error("packet would need too many fragments")]
    TooManyFragments,
}

pub struct Host<S: Socket> {
    pub(crate) socket: S,
    clock: Box<dyn Clock>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) channel_limit: usize,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) mtu: u32,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
    pub(crate) duplicate_peers: usize,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,
    total_queued: u32,
    pub(crate) service_time: u32,
    pub(crate) dispatch_queue: VecDeque<usize>,
    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) checksum: Option<Box<dyn Checksum>>,
    rng: StdRng,
    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

impl<S: Socket> Host<S> {
    /// Create a host driven by the system's monotonic clock.
    pub fn new(socket: S, config: HostConfig) -> Result<Self, ConfigError> {
        Self::with_clock(socket, config, Box::new(SteadyClock::default()))
    }

    /// Create a host with an explicit clock; tests drive a virtual one.
    pub fn with_clock(
        socket: S,
        config: HostConfig,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if config.peer_count == 0 || config.peer_count > usize::from(MAXIMUM_PEER_ID) {
            return Err(ConfigError::InvalidPeerCount);
        }
        let mtu = config.mtu;
        Ok(Self {
            socket,
            clock,
            peers: (0..config.peer_count)
                .map(|i| Peer::new(i as u16, mtu))
                .collect(),
            channel_limit: clamp_channel_limit(config.channel_limit),
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            mtu,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            duplicate_peers: config.duplicate_peers.max(1),
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            total_queued: 0,
            service_time: 0,
            dispatch_queue: VecDeque::new(),
            compressor: None,
            checksum: None,
            rng: StdRng::from_entropy(),
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[peer.0]
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    /// (sent bytes, sent datagrams, received bytes, received datagrams)
    pub fn statistics(&self) -> (u64, u64, u64, u64) {
        (
            self.total_sent_data,
            self.total_sent_packets,
            self.total_received_data,
            self.total_received_packets,
        )
    }

    /// Limit the channels granted to future incoming connections.
    pub fn channel_limit(&mut self, limit: usize) {
        self.channel_limit = clamp_channel_limit(limit);
    }

    /// Adjust the host's bandwidth limits and schedule renegotiation with
    /// every connected peer.
    pub fn bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self.recalculate_bandwidth_limits = true;
    }

    /// Install or remove the datagram compressor.
    pub fn compress(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Install or remove the datagram checksum.
    pub fn checksum(&mut self, checksum: Option<Box<dyn Checksum>>) {
        self.checksum = checksum;
    }

    /// Initiate a connection. The new peer is only usable once `service`
    /// returns its [`Event::Connect`].
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, ConnectError> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);
        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(ConnectError::NoFreeSlots)?;

        let connect_id: u32 = self.rng.gen();
        let window_size = initial_window_size(self.outgoing_bandwidth);
        let command = {
            let peer = &mut self.peers[index];
            peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
            peer.state = PeerState::Connecting;
            peer.address = Some(address);
            peer.connect_id = connect_id;
            peer.mtu = self.mtu;
            peer.window_size = window_size;
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: SYSTEM_CHANNEL_ID,
                reliable_sequence_number: 0,
                body: CommandBody::Connect {
                    params: ConnectParams {
                        outgoing_peer_id: peer.incoming_peer_id,
                        incoming_session_id: peer.incoming_session_id,
                        outgoing_session_id: peer.outgoing_session_id,
                        mtu: peer.mtu,
                        window_size: peer.window_size,
                        channel_count: channel_count as u32,
                        incoming_bandwidth: self.incoming_bandwidth,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                        packet_throttle_interval: peer.packet_throttle_interval,
                        packet_throttle_acceleration: peer.packet_throttle_acceleration,
                        packet_throttle_deceleration: peer.packet_throttle_deceleration,
                        connect_id,
                    },
                    data,
                },
            }
        };
        self.queue_command(index, command, None, 0, 0);
        Ok(PeerId(index))
    }

    /// Queue a packet for transmission, fragmenting it when it exceeds what
    /// one datagram can carry.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<(), SendError> {
        self.send_shared(peer.0, channel_id, packet.into_shared())
    }

    /// Queue a packet to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        let shared = packet.into_shared();
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            let _ = self.send_shared(index, channel_id, shared.clone());
        }
    }

    fn send_shared(
        &mut self,
        index: usize,
        channel_id: u8,
        packet: Arc<SharedPacket>,
    ) -> Result<(), SendError> {
        let peer = &self.peers[index];
        if peer.state != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if usize::from(channel_id) >= peer.channels.len() {
            return Err(SendError::InvalidChannel);
        }
        if packet.len() > self.maximum_packet_size {
            return Err(SendError::PacketTooLarge);
        }

        let mut fragment_length = peer.mtu as usize - command_size(Opcode::SendFragment);
        if self.checksum.is_some() {
            fragment_length -= CHECKSUM_SIZE;
        }

        let channel = &peer.channels[usize::from(channel_id)];
        let flags = packet.flags();

        if packet.len() > fragment_length {
            let fragment_count = (packet.len() + fragment_length - 1) / fragment_length;
            if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
                return Err(SendError::TooManyFragments);
            }

            let unreliable = flags.contains(PacketFlags::UNRELIABLE_FRAGMENT)
                && !flags.contains(PacketFlags::RELIABLE)
                && channel.outgoing_unreliable_sequence_number < 0xFFFF;
            let (command_flags, start_sequence_number) = if unreliable {
                (0, channel.outgoing_unreliable_sequence_number.wrapping_add(1))
            } else {
                (
                    COMMAND_FLAG_ACKNOWLEDGE,
                    channel.outgoing_reliable_sequence_number.wrapping_add(1),
                )
            };

            let mut fragment_offset = 0usize;
            let mut fragment_number = 0u32;
            while fragment_offset < packet.len() {
                let length = fragment_length.min(packet.len() - fragment_offset);
                let info = FragmentInfo {
                    start_sequence_number,
                    data_length: length as u16,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length: packet.len() as u32,
                    fragment_offset: fragment_offset as u32,
                };
                let command = Command {
                    flags: command_flags,
                    channel_id,
                    reliable_sequence_number: 0,
                    body: if unreliable {
                        CommandBody::SendUnreliableFragment(info)
                    } else {
                        CommandBody::SendFragment(info)
                    },
                };
                self.queue_command(
                    index,
                    command,
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                );
                fragment_offset += length;
                fragment_number += 1;
            }
            return Ok(());
        }

        let data_length = packet.len() as u16;
        let command = if flags.contains(PacketFlags::UNSEQUENCED)
            && !flags.contains(PacketFlags::RELIABLE)
        {
            Command {
                flags: COMMAND_FLAG_UNSEQUENCED,
                channel_id,
                reliable_sequence_number: 0,
                body: CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            }
        } else if flags.contains(PacketFlags::RELIABLE)
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id,
                reliable_sequence_number: 0,
                body: CommandBody::SendReliable { data_length },
            }
        } else {
            Command {
                flags: 0,
                channel_id,
                reliable_sequence_number: 0,
                body: CommandBody::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            }
        };
        let length = packet.len() as u16;
        self.queue_command(index, command, Some(packet), 0, length);
        Ok(())
    }

    /// Pull the next delivered packet for a peer, outside of `service`.
    pub fn receive(&mut self, peer: PeerId) -> Option<(u8, Packet)> {
        let index = peer.0;
        let received = self.peers[index].receive_dispatched();
        if self.peers[index].dispatched_commands.is_empty()
            && self.peers[index].flags & PEER_FLAG_NEEDS_DISPATCH != 0
        {
            self.peers[index].flags &= !PEER_FLAG_NEEDS_DISPATCH;
            self.dispatch_queue.retain(|&i| i != index);
        }
        received
    }

    /// Send a ping immediately; pings also go out automatically on idle
    /// connections.
    pub fn ping(&mut self, peer: PeerId) {
        let index = peer.0;
        if self.peers[index].state != PeerState::Connected {
            return;
        }
        self.queue_command(index, ping_command(), None, 0, 0);
    }

    pub fn ping_interval(&mut self, peer: PeerId, interval_ms: u32) {
        self.peers[peer.0].ping_interval = if interval_ms != 0 {
            interval_ms
        } else {
            PEER_PING_INTERVAL
        };
    }

    /// Adjust retransmission give-up thresholds; zero restores a default.
    pub fn timeout(&mut self, peer: PeerId, limit: u32, minimum_ms: u32, maximum_ms: u32) {
        let peer = &mut self.peers[peer.0];
        peer.timeout_limit = if limit != 0 { limit } else { PEER_TIMEOUT_LIMIT };
        peer.timeout_minimum = if minimum_ms != 0 {
            minimum_ms
        } else {
            PEER_TIMEOUT_MINIMUM
        };
        peer.timeout_maximum = if maximum_ms != 0 {
            maximum_ms
        } else {
            PEER_TIMEOUT_MAXIMUM
        };
    }

    /// Reconfigure the unreliable-packet throttle and tell the remote side.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval_ms: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        let index = peer.0;
        {
            let peer = &mut self.peers[index];
            peer.packet_throttle_interval = interval_ms;
            peer.packet_throttle_acceleration = acceleration;
            peer.packet_throttle_deceleration = deceleration;
        }
        let command = Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: SYSTEM_CHANNEL_ID,
            reliable_sequence_number: 0,
            body: CommandBody::ThrottleConfigure {
                packet_throttle_interval: interval_ms,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        };
        self.queue_command(index, command, None, 0, 0);
    }

    /// Request a disconnect; queued traffic is abandoned. The local side gets
    /// an [`Event::Disconnect`] once the handshake completes.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        if matches!(
            self.peers[index].state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }
        self.reset_peer_queues(index);

        let was_established = matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        );
        let command = Command {
            flags: if was_established {
                COMMAND_FLAG_ACKNOWLEDGE
            } else {
                COMMAND_FLAG_UNSEQUENCED
            },
            channel_id: SYSTEM_CHANNEL_ID,
            reliable_sequence_number: 0,
            body: CommandBody::Disconnect { data },
        };
        self.queue_command(index, command, None, 0, 0);

        if was_established {
            self.on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            let _ = self.flush();
            self.reset_peer(index);
        }
    }

    /// Disconnect once every queued outgoing packet has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        if matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) && self.peers[index].has_outgoing_commands()
        {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
        } else {
            self.disconnect(peer, data);
        }
    }

    /// Tear the connection down immediately. A single unsequenced disconnect
    /// is flushed as a courtesy; no local event is generated.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        if self.peers[index].state == PeerState::Disconnected {
            return;
        }
        if !matches!(
            self.peers[index].state,
            PeerState::Zombie | PeerState::Disconnecting
        ) {
            self.reset_peer_queues(index);
            let command = Command {
                flags: COMMAND_FLAG_UNSEQUENCED,
                channel_id: SYSTEM_CHANNEL_ID,
                reliable_sequence_number: 0,
                body: CommandBody::Disconnect { data },
            };
            self.queue_command(index, command, None, 0, 0);
            let _ = self.flush();
        }
        self.reset_peer(index);
    }

    /// Forcefully free the slot without notifying the remote side.
    pub fn reset(&mut self, peer: PeerId) {
        self.reset_peer(peer.0);
    }

    /// Drain pending events without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_events()
    }

    /// One non-blocking pass over the outgoing pipeline.
    pub fn flush(&mut self) -> io::Result<()> {
        self.service_time = self.clock.now_ms();
        self.send_outgoing_commands(false)
    }

    /// Run the protocol: dispatch one pending event if any, otherwise run
    /// housekeeping and the send/receive pipelines, waiting on the socket up
    /// to `timeout_ms` for something to happen.
    pub fn service(&mut self, timeout_ms: u32) -> io::Result<Option<Event>> {
        if let Some(event) = self.dispatch_events() {
            return Ok(Some(event));
        }

        self.service_time = self.clock.now_ms();
        let deadline = self.service_time.wrapping_add(timeout_ms);

        loop {
            if timing::time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= HOST_BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            self.send_outgoing_commands(true)?;
            self.receive_incoming_commands()?;
            self.send_outgoing_commands(true)?;

            if let Some(event) = self.dispatch_events() {
                return Ok(Some(event));
            }

            self.service_time = self.clock.now_ms();
            if timing::time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            // Wake early for the soonest retransmission deadline.
            let mut wake = deadline;
            for peer in &self.peers {
                if !peer.sent_reliable_commands.is_empty()
                    && timing::time_less(peer.next_timeout, wake)
                {
                    wake = peer.next_timeout;
                }
            }
            if timing::time_greater(wake, self.service_time) {
                let wait = timing::time_difference(wake, self.service_time);
                self.socket.wait(wait)?;
            }
            self.service_time = self.clock.now_ms();
        }
    }

    pub(crate) fn queue_command(
        &mut self,
        index: usize,
        command: Command,
        packet: Option<Arc<SharedPacket>>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.total_queued = self.total_queued.wrapping_add(1);
        let queue_time = self.total_queued;
        self.peers[index].queue_outgoing_command(
            command,
            packet,
            fragment_offset,
            fragment_length,
            queue_time,
        );
    }

    fn dispatch_events(&mut self) -> Option<Event> {
        while let Some(index) = self.dispatch_queue.pop_front() {
            self.peers[index].flags &= !PEER_FLAG_NEEDS_DISPATCH;
            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);
                    let data = self.peers[index].event_data;
                    trace!(peer = index, "connection established");
                    return Some(Event::Connect {
                        peer: PeerId(index),
                        data,
                    });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    self.reset_peer(index);
                    trace!(peer = index, "connection dissolved");
                    return Some(Event::Disconnect {
                        peer: PeerId(index),
                        data,
                    });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = self.peers[index].receive_dispatched() else {
                        continue;
                    };
                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.peers[index].flags |= PEER_FLAG_NEEDS_DISPATCH;
                        self.dispatch_queue.push_back(index);
                    }
                    return Some(Event::Receive {
                        peer: PeerId(index),
                        channel_id,
                        packet,
                    });
                }
                _ => {}
            }
        }
        None
    }

    /// Transition a peer's state, maintaining the connected-peer counters
    /// that feed the bandwidth throttle.
    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        if matches!(state, PeerState::Connected | PeerState::DisconnectLater) {
            self.on_connect(index);
        } else {
            self.on_disconnect(index);
        }
        self.peers[index].state = state;
    }

    /// Transition and queue the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        self.peers[index].mark_needs_dispatch(&mut self.dispatch_queue);
    }

    pub(crate) fn on_connect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if !matches!(
            peer.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    pub(crate) fn on_disconnect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if matches!(
            peer.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
            self.connected_peers -= 1;
        }
    }

    pub(crate) fn reset_peer_queues(&mut self, index: usize) {
        if self.peers[index].flags & PEER_FLAG_NEEDS_DISPATCH != 0 {
            self.dispatch_queue.retain(|&i| i != index);
            self.peers[index].flags &= !PEER_FLAG_NEEDS_DISPATCH;
        }
        self.peers[index].reset_queues();
    }

    pub(crate) fn reset_peer(&mut self, index: usize) {
        self.on_disconnect(index);
        if self.peers[index].flags & PEER_FLAG_NEEDS_DISPATCH != 0 {
            self.dispatch_queue.retain(|&i| i != index);
        }
        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }

    /// Periodic fair-share pass: derive every peer's packet-throttle ceiling
    /// from its advertised receive rate and the host's send budget, then
    /// partition the host's receive budget and notify the peers it binds.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.service_time;
        let elapsed = time_current.wrapping_sub(self.bandwidth_throttle_epoch);
        if elapsed < HOST_BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = ((u64::from(self.outgoing_bandwidth) * u64::from(elapsed)) / 1000) as u32;
            for peer in &self.peers {
                if is_established(peer.state) {
                    data_total = data_total.wrapping_add(peer.outgoing_data_total);
                }
            }
        }

        let mut throttle;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                ((u64::from(bandwidth) * u64::from(PEER_PACKET_THROTTLE_SCALE))
                    / u64::from(data_total)) as u32
            };

            for peer in &mut self.peers {
                if !is_established(peer.state)
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                let peer_bandwidth =
                    ((u64::from(peer.incoming_bandwidth) * u64::from(elapsed)) / 1000) as u32;
                if u64::from(throttle) * u64::from(peer.outgoing_data_total)
                    <= u64::from(peer_bandwidth) * u64::from(PEER_PACKET_THROTTLE_SCALE)
                {
                    continue;
                }
                // This peer's own receive rate is the binding constraint.
                peer.packet_throttle_limit = (((u64::from(peer_bandwidth)
                    * u64::from(PEER_PACKET_THROTTLE_SCALE))
                    / u64::from(peer.outgoing_data_total)) as u32)
                    .max(1);
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);
                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                ((u64::from(bandwidth) * u64::from(PEER_PACKET_THROTTLE_SCALE))
                    / u64::from(data_total)) as u32
            };
            for peer in &mut self.peers {
                if !is_established(peer.state)
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                peer.packet_throttle_limit = throttle;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;
            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;
                    for peer in &mut self.peers {
                        if !is_established(peer.state)
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }
                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            for index in 0..self.peers.len() {
                let peer = &self.peers[index];
                if !is_established(peer.state) {
                    continue;
                }
                let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == time_current
                {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                let command = Command {
                    flags: COMMAND_FLAG_ACKNOWLEDGE,
                    channel_id: SYSTEM_CHANNEL_ID,
                    reliable_sequence_number: 0,
                    body: CommandBody::BandwidthLimit {
                        incoming_bandwidth,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                    },
                };
                self.queue_command(index, command, None, 0, 0);
            }
        }
    }
}

pub(crate) fn is_established(state: PeerState) -> bool {
    matches!(state, PeerState::Connected | PeerState::DisconnectLater)
}

pub(crate) fn ping_command() -> Command {
    Command {
        flags: COMMAND_FLAG_ACKNOWLEDGE,
        channel_id: SYSTEM_CHANNEL_ID,
        reliable_sequence_number: 0,
        body: CommandBody::Ping,
    }
}

fn clamp_channel_limit(limit: usize) -> usize {
    if limit == 0 || limit > MAXIMUM_CHANNEL_COUNT {
        MAXIMUM_CHANNEL_COUNT
    } else {
        limit.max(MINIMUM_CHANNEL_COUNT)
    }
}

fn initial_window_size(outgoing_bandwidth: u32) -> u32 {
    if outgoing_bandwidth == 0 {
        return MAXIMUM_WINDOW_SIZE;
    }
    ((outgoing_bandwidth / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
        .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

/// Window size negotiated from the two sides' bandwidth limits.
pub(crate) fn negotiated_window_size(a: u32, b: u32) -> u32 {
    let window = if a == 0 && b == 0 {
        return MAXIMUM_WINDOW_SIZE;
    } else if a == 0 || b == 0 {
        (a.max(b) / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    } else {
        (a.min(b) / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    };
    window.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}
