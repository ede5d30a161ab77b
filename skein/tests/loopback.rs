//! End-to-end smoke test over real loopback UDP sockets.

use skein::{Event, Host, HostConfig, Packet, StdSocket};

#[test]
fn loopback_echo_and_disconnect() {
    let server_socket = StdSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let mut server = Host::new(server_socket, HostConfig::new(4)).unwrap();

    let client_socket = StdSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let mut client = Host::new(client_socket, HostConfig::new(1)).unwrap();
    let client_peer = client.connect(server_addr, 2, 99).unwrap();

    let mut client_connected = false;
    let mut server_peer = None;
    let mut server_got = None;
    let mut echoed = None;

    for _ in 0..2000 {
        match client.service(1).unwrap() {
            Some(Event::Connect { .. }) => {
                client_connected = true;
                client
                    .send(client_peer, 0, Packet::reliable(&b"marco"[..]))
                    .unwrap();
            }
            Some(Event::Receive { packet, .. }) => {
                echoed = Some(packet.data().to_vec());
            }
            _ => {}
        }
        match server.service(1).unwrap() {
            Some(Event::Connect { peer, data }) => {
                assert_eq!(data, 99);
                server_peer = Some(peer);
            }
            Some(Event::Receive {
                peer,
                channel_id,
                packet,
            }) => {
                server_got = Some(packet.data().to_vec());
                server
                    .send(peer, channel_id, Packet::reliable(&b"polo"[..]))
                    .unwrap();
            }
            _ => {}
        }
        if echoed.is_some() {
            break;
        }
    }

    assert!(client_connected, "client never connected");
    assert!(server_peer.is_some(), "server never accepted");
    assert_eq!(server_got.as_deref(), Some(&b"marco"[..]));
    assert_eq!(echoed.as_deref(), Some(&b"polo"[..]));

    client.disconnect(client_peer, 3);
    let mut server_saw_disconnect = false;
    for _ in 0..2000 {
        if let Some(Event::Disconnect { data, .. }) = server.service(1).unwrap() {
            assert_eq!(data, 3);
            server_saw_disconnect = true;
            break;
        }
        client.service(1).unwrap();
    }
    assert!(server_saw_disconnect, "server never saw the disconnect");
}
