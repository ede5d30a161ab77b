use assert_matches::assert_matches;

use crate::packet::PacketFlags;
use crate::peer::PeerState;
use crate::{Compressor, Crc32, HostConfig, Packet, SendError};

mod util;
use util::Pair;

#[test]
fn handshake_connects_both_sides() {
    let mut pair = Pair::new();
    let (client_peer, server_peer) = pair.connect();

    assert_eq!(
        pair.client.host.peer(client_peer).state(),
        PeerState::Connected
    );
    assert_eq!(
        pair.server.host.peer(server_peer).state(),
        PeerState::Connected
    );
    assert_eq!(pair.client.host.peer(client_peer).channel_count(), 4);
    assert_eq!(pair.server.host.peer(server_peer).channel_count(), 4);
    assert_eq!(pair.client.host.connected_peers(), 1);
    assert_eq!(pair.server.host.connected_peers(), 1);
}

#[test]
fn reliable_round_trip() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    let payload = vec![0xAB; 100];
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(payload.clone()))
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.received(), vec![(0, payload)]);
    // Acked on the first attempt: nothing left in the retransmission queue
    // and no losses recorded.
    let peer = pair.client.host.peer(client_peer);
    assert!(peer.sent_reliable_commands.is_empty());
    assert_eq!(peer.packets_lost, 0);
}

#[test]
fn lost_reliable_packet_is_resent() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    pair.client.drop_next = 1;
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"persist"[..]))
        .unwrap();
    pair.drive();
    assert!(pair.server.received().is_empty());

    // The handshake seeded a ~1ms RTT; one retransmission timeout later the
    // command goes out again.
    pair.drive_for(50, 10);

    assert_eq!(pair.server.received(), vec![(0, b"persist".to_vec())]);
    let peer = pair.client.host.peer(client_peer);
    assert!(peer.sent_reliable_commands.is_empty());
    assert_eq!(peer.packets_lost, 1);
}

#[test]
fn resend_does_not_duplicate_delivery() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"once"[..]))
        .unwrap();
    // Let the data datagram through but swallow the ack, forcing a resend
    // the server must recognize as a duplicate.
    pair.client.host.flush().unwrap();
    pair.deliver();
    pair.server.drop_next = 1;
    pair.server.pump();
    pair.deliver();
    pair.drive_for(50, 10);

    assert_eq!(pair.server.received(), vec![(0, b"once".to_vec())]);
}

#[test]
fn large_packet_fragments_and_reassembles() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
    pair.client
        .host
        .send(client_peer, 2, Packet::reliable(payload.clone()))
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.received(), vec![(2, payload)]);
}

#[test]
fn fragments_survive_datagram_loss() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i ^ (i >> 3)) as u8).collect();
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(payload.clone()))
        .unwrap();
    pair.client.drop_next = 2;
    pair.drive();
    pair.drive_for(100, 10);

    assert_eq!(pair.server.received(), vec![(0, payload)]);
}

#[test]
fn unsequenced_duplicate_is_suppressed() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::unsequenced(&b"solo"[..]))
        .unwrap();
    pair.client.host.flush().unwrap();

    // Replay the datagram verbatim.
    let datagrams: Vec<_> = pair.client.outbound.borrow().iter().cloned().collect();
    for datagram in datagrams {
        pair.client.outbound.borrow_mut().push_back(datagram);
    }
    pair.drive();

    assert_eq!(pair.server.received(), vec![(0, b"solo".to_vec())]);
}

#[test]
fn graceful_disconnect_flushes_queued_packets() {
    let mut pair = Pair::new();
    let (client_peer, server_peer) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"first"[..]))
        .unwrap();
    pair.client
        .host
        .send(client_peer, 1, Packet::reliable(&b"second"[..]))
        .unwrap();
    pair.client.host.disconnect_later(client_peer, 7);
    pair.drive();

    assert_eq!(
        pair.server.received(),
        vec![(0, b"first".to_vec()), (1, b"second".to_vec())]
    );
    assert_eq!(pair.server.disconnect_events(), vec![(server_peer, 7)]);
    assert_eq!(pair.client.disconnect_events(), vec![(client_peer, 0)]);
    assert_eq!(
        pair.client.host.peer(client_peer).state(),
        PeerState::Disconnected
    );
    assert_eq!(
        pair.server.host.peer(server_peer).state(),
        PeerState::Disconnected
    );
}

#[test]
fn unacknowledged_peer_times_out() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();
    pair.client.host.timeout(client_peer, 4, 20, 200);

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"void"[..]))
        .unwrap();

    // The server is gone: every datagram the client sends vanishes.
    let mut disconnected = false;
    for _ in 0..200 {
        pair.clock.advance(10);
        pair.client.pump();
        pair.client.outbound.borrow_mut().clear();
        if !pair.client.disconnect_events().is_empty() {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected, "peer never timed out");
    assert_eq!(
        pair.client.host.peer(client_peer).state(),
        PeerState::Disconnected
    );
}

#[test]
fn unreliable_delivery_skips_losses_but_keeps_order() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    for (i, lost) in [false, true, false].into_iter().enumerate() {
        let payload = vec![i as u8; 8];
        pair.client
            .host
            .send(client_peer, 0, Packet::unreliable(payload))
            .unwrap();
        if lost {
            pair.client.drop_next = 1;
        }
        pair.client.host.flush().unwrap();
        pair.deliver();
    }
    pair.drive();

    assert_eq!(
        pair.server.received(),
        vec![(0, vec![0u8; 8]), (0, vec![2u8; 8])]
    );
}

#[test]
fn reordered_reliable_packets_deliver_in_order() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"one"[..]))
        .unwrap();
    pair.client.host.flush().unwrap();
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"two"[..]))
        .unwrap();
    pair.client.host.flush().unwrap();

    // Swap the two datagrams in flight.
    {
        let mut outbound = pair.client.outbound.borrow_mut();
        assert_eq!(outbound.len(), 2);
        outbound.swap(0, 1);
    }
    pair.drive();

    assert_eq!(
        pair.server.received(),
        vec![(0, b"one".to_vec()), (0, b"two".to_vec())]
    );
}

#[test]
fn channels_sequence_independently() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    for channel in [3u8, 1, 3, 0] {
        pair.client
            .host
            .send(client_peer, channel, Packet::reliable(vec![channel]))
            .unwrap();
    }
    pair.drive();

    assert_eq!(
        pair.server.received(),
        vec![
            (3, vec![3]),
            (1, vec![1]),
            (3, vec![3]),
            (0, vec![0]),
        ]
    );
}

#[test]
fn zero_throttle_drops_unreliable_but_not_reliable() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();
    pair.client.host.peers[client_peer.0].packet_throttle = 0;

    pair.client
        .host
        .send(client_peer, 0, Packet::unreliable(&b"droppable"[..]))
        .unwrap();
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"durable"[..]))
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.received(), vec![(0, b"durable".to_vec())]);
}

#[test]
fn send_rejects_bad_arguments() {
    let mut pair = Pair::with_configs(
        HostConfig::new(8),
        HostConfig {
            maximum_packet_size: 1024,
            ..HostConfig::new(8)
        },
    );
    let (client_peer, _) = pair.connect_with(2, 0);

    assert_matches!(
        pair.client
            .host
            .send(client_peer, 9, Packet::reliable(&b"x"[..])),
        Err(SendError::InvalidChannel)
    );

    let mut small = HostConfig::new(2);
    small.maximum_packet_size = 64;
    let mut lonely = Pair::with_configs(small, HostConfig::new(2));
    let (peer, _) = lonely.connect_with(1, 0);
    assert_matches!(
        lonely
            .client
            .host
            .send(peer, 0, Packet::reliable(vec![0; 65])),
        Err(SendError::PacketTooLarge)
    );
    lonely.client.host.disconnect_now(peer, 0);
    assert_matches!(
        lonely.client.host.send(peer, 0, Packet::reliable(&b"x"[..])),
        Err(SendError::NotConnected)
    );
}

#[test]
fn idle_connection_pings() {
    let mut pair = Pair::new();
    let (_client_peer, server_peer) = pair.connect();

    let (_, before_sent, ..) = pair.client.host.statistics();
    pair.drive_for(2000, 100);

    let (_, after_sent, ..) = pair.client.host.statistics();
    assert!(after_sent > before_sent, "no pings went out while idle");
    assert_eq!(
        pair.server.host.peer(server_peer).state(),
        PeerState::Connected
    );
    assert!(pair.server.received().is_empty());
}

#[test]
fn broadcast_reaches_connected_peers() {
    let mut pair = Pair::new();
    let (_client_peer, _server_peer) = pair.connect();

    pair.server.host.broadcast(1, Packet::reliable(&b"toutes"[..]));
    pair.drive();

    assert_eq!(pair.client.received(), vec![(1, b"toutes".to_vec())]);
}

/// Run-length coder; only useful against repetitive payloads, which is
/// exactly what makes the compressed-path flag observable.
struct RunLength;

impl Compressor for RunLength {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        let mut written = 0;
        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            let mut run = 1usize;
            while i + run < input.len() && input[i + run] == byte && run < 255 {
                run += 1;
            }
            if written + 2 > output.len() {
                return None;
            }
            output[written] = run as u8;
            output[written + 1] = byte;
            written += 2;
            i += run;
        }
        Some(written)
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        let mut written = 0;
        for pair in input.chunks(2) {
            let [run, byte] = *pair else { return None };
            let run = usize::from(run);
            if written + run > output.len() {
                return None;
            }
            output[written..written + run].fill(byte);
            written += run;
        }
        Some(written)
    }
}

#[test]
fn compressed_datagrams_roundtrip() {
    let mut pair = Pair::new();
    pair.client.host.compress(Some(Box::new(RunLength)));
    pair.server.host.compress(Some(Box::new(RunLength)));
    let (client_peer, _) = pair.connect();

    let payload = vec![0x42u8; 600];
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(payload.clone()))
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.received(), vec![(0, payload)]);
}

#[test]
fn checksum_rejects_corruption() {
    let mut pair = Pair::new();
    pair.client.host.checksum(Some(Box::new(Crc32::default())));
    pair.server.host.checksum(Some(Box::new(Crc32::default())));
    let (client_peer, _) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(&b"unscathed"[..]))
        .unwrap();
    pair.client.host.flush().unwrap();
    {
        let mut outbound = pair.client.outbound.borrow_mut();
        let (_, datagram) = outbound.front_mut().unwrap();
        *datagram.last_mut().unwrap() ^= 0xFF;
    }
    pair.drive();
    assert!(pair.server.received().is_empty());

    // Retransmission carries an intact copy.
    pair.drive_for(50, 10);
    assert_eq!(pair.server.received(), vec![(0, b"unscathed".to_vec())]);
}

#[test]
fn bandwidth_renegotiation_propagates_limits() {
    let mut pair = Pair::with_configs(
        HostConfig {
            incoming_bandwidth: 64_000,
            outgoing_bandwidth: 64_000,
            ..HostConfig::new(8)
        },
        HostConfig {
            outgoing_bandwidth: 48_000,
            ..HostConfig::new(8)
        },
    );
    let (client_peer, server_peer) = pair.connect();

    // The server learned the client's limits from the handshake.
    assert_eq!(
        pair.server.host.peer(server_peer).incoming_bandwidth,
        64_000
    );

    pair.client.host.bandwidth_limit(32_000, 16_000);
    pair.drive_for(2500, 250);

    assert_eq!(
        pair.server.host.peer(server_peer).incoming_bandwidth,
        32_000
    );
    assert_eq!(
        pair.server.host.peer(server_peer).outgoing_bandwidth,
        16_000
    );
    assert_eq!(
        pair.client.host.peer(client_peer).state(),
        PeerState::Connected
    );
}

#[test]
fn unreliable_fragments_reassemble() {
    let mut pair = Pair::new();
    let (client_peer, _) = pair.connect();

    let payload: Vec<u8> = (0..5000u32).map(|i| (i * 13) as u8).collect();
    pair.client
        .host
        .send(
            client_peer,
            0,
            Packet::new(payload.clone(), PacketFlags::UNRELIABLE_FRAGMENT),
        )
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.received(), vec![(0, payload)]);
}

#[test]
fn waiting_data_ceiling_drops_incoming() {
    let mut pair = Pair::with_configs(
        HostConfig::new(8),
        HostConfig {
            maximum_waiting_data: 64,
            ..HostConfig::new(8)
        },
    );
    let (client_peer, server_peer) = pair.connect();

    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(vec![1u8; 100]))
        .unwrap();
    pair.client
        .host
        .send(client_peer, 0, Packet::reliable(vec![2u8; 100]))
        .unwrap();
    // Flush both without letting the server's application drain; the second
    // packet trips the ceiling and is dropped without an ack, then recovered
    // by retransmission once the first is claimed.
    pair.client.host.flush().unwrap();
    pair.deliver();
    pair.server.pump();
    pair.deliver();
    pair.drive_for(100, 10);

    let received = pair.server.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].1, vec![1u8; 100]);
    assert_eq!(received[1].1, vec![2u8; 100]);
    assert_eq!(pair.server.host.peer(server_peer).total_waiting_data(), 0);
}
