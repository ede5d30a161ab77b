//! Deterministic two-host harness: in-memory sockets, a virtual clock, and
//! scriptable datagram loss.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info_span;

use crate::{Clock, Event, Host, HostConfig, PeerId, Socket};

pub type Queue = Rc<RefCell<VecDeque<(SocketAddr, Vec<u8>)>>>;

pub struct VirtualClock(AtomicU32);

impl VirtualClock {
    pub fn new() -> Arc<Self> {
        // Away from zero so "never" sentinels stay distinguishable.
        Arc::new(Self(AtomicU32::new(1000)))
    }

    pub fn advance(&self, ms: u32) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Socket backed by two shared queues; `outbound` entries carry the
/// destination, `inbound` entries the source.
pub struct TestSocket {
    pub inbound: Queue,
    pub outbound: Queue,
}

impl Socket for TestSocket {
    fn send(&mut self, remote: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.outbound.borrow_mut().push_back((remote, data.to_vec()));
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((from, data)) = self.inbound.borrow_mut().pop_front() else {
            return Ok(None);
        };
        let length = data.len().min(buf.len());
        buf[..length].copy_from_slice(&data[..length]);
        Ok(Some((length, from)))
    }

    fn wait(&mut self, _timeout_ms: u32) -> io::Result<bool> {
        Ok(!self.inbound.borrow().is_empty())
    }
}

pub struct Side {
    pub host: Host<TestSocket>,
    pub addr: SocketAddr,
    pub outbound: Queue,
    pub inbound: Queue,
    pub events: Vec<Event>,
    /// Datagrams this side sends next that the link swallows.
    pub drop_next: usize,
    name: &'static str,
}

impl Side {
    fn new(
        name: &'static str,
        addr: SocketAddr,
        config: HostConfig,
        clock: Arc<VirtualClock>,
    ) -> Self {
        let inbound: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let outbound: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let socket = TestSocket {
            inbound: inbound.clone(),
            outbound: outbound.clone(),
        };
        let host = Host::with_clock(socket, config, Box::new(clock)).unwrap();
        Self {
            host,
            addr,
            outbound,
            inbound,
            events: Vec::new(),
            drop_next: 0,
            name,
        }
    }

    /// Run `service(0)` until it yields no further event.
    pub fn pump(&mut self) -> bool {
        let span = info_span!("side", name = self.name);
        let _guard = span.enter();
        let mut progressed = false;
        while let Some(event) = self.host.service(0).unwrap() {
            self.events.push(event);
            progressed = true;
        }
        progressed
    }

    pub fn connect_events(&self) -> Vec<(PeerId, u32)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Connect { peer, data } => Some((*peer, *data)),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_events(&self) -> Vec<(PeerId, u32)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Disconnect { peer, data } => Some((*peer, *data)),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self) -> Vec<(u8, Vec<u8>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Receive {
                    channel_id, packet, ..
                } => Some((*channel_id, packet.data().to_vec())),
                _ => None,
            })
            .collect()
    }
}

fn shuttle(from: &mut Side, to: &mut Side) -> bool {
    let mut moved = false;
    while let Some((destination, data)) = from.outbound.borrow_mut().pop_front() {
        if from.drop_next > 0 {
            from.drop_next -= 1;
            continue;
        }
        if destination == to.addr {
            to.inbound.borrow_mut().push_back((from.addr, data));
            moved = true;
        }
    }
    moved
}

pub struct Pair {
    pub client: Side,
    pub server: Side,
    pub clock: Arc<VirtualClock>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_configs(HostConfig::new(8), HostConfig::new(8))
    }

    pub fn with_configs(client: HostConfig, server: HostConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        let clock = VirtualClock::new();
        Self {
            client: Side::new(
                "client",
                "127.0.0.1:40001".parse().unwrap(),
                client,
                clock.clone(),
            ),
            server: Side::new(
                "server",
                "127.0.0.1:40002".parse().unwrap(),
                server,
                clock.clone(),
            ),
            clock,
        }
    }

    /// Move queued outbound datagrams onto the destination's inbound queue,
    /// honoring each side's `drop_next` budget.
    pub fn deliver(&mut self) -> bool {
        let forward = shuttle(&mut self.client, &mut self.server);
        let backward = shuttle(&mut self.server, &mut self.client);
        forward || backward
    }

    /// Service both sides and shuttle datagrams until the network quiesces.
    pub fn drive(&mut self) {
        for _ in 0..1000 {
            let mut progressed = false;
            progressed |= self.client.pump();
            progressed |= self.deliver();
            progressed |= self.server.pump();
            progressed |= self.deliver();
            if !progressed {
                return;
            }
        }
        panic!("network failed to quiesce");
    }

    /// Advance virtual time in `step`-ms increments, driving in between.
    pub fn drive_for(&mut self, total_ms: u32, step_ms: u32) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            self.clock.advance(step_ms);
            elapsed += step_ms;
            self.drive();
        }
    }

    /// Complete a client-initiated handshake; returns the client-side and
    /// server-side peer handles.
    pub fn connect(&mut self) -> (PeerId, PeerId) {
        self.connect_with(4, 42)
    }

    pub fn connect_with(&mut self, channel_count: usize, data: u32) -> (PeerId, PeerId) {
        let client_peer = self
            .client
            .host
            .connect(self.server.addr, channel_count, data)
            .unwrap();
        self.drive();
        let client_events = self.client.connect_events();
        let server_events = self.server.connect_events();
        assert_eq!(client_events.len(), 1, "client saw its connect event");
        assert_eq!(server_events.len(), 1, "server saw the incoming connect");
        assert_eq!(server_events[0].1, data);
        self.client.events.clear();
        self.server.events.clear();
        (client_peer, server_events[0].0)
    }
}
