// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenLattice.

// OpenLattice is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenLattice is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenLattice.  If not, see <http://www.gnu.org/licenses/>.

//! OpenLattice network library: wire codec, duplicate filter, channels and
//! the realtime peer set.
//!
//! The library is transport-facing only; it knows nothing about ledgers or
//! elections. The node attaches an `inbound` callback through which every
//! realtime message is delivered.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use parking_lot::Mutex;

use lattice_types::{Account, Block, EndpointKey, KeyPair, NetworkParams, Vote};

pub mod channel;
pub mod filter;
pub mod limiter;
pub mod messages;
pub mod syn_cookies;
pub mod tcp;

pub use channel::{BufferDropPolicy, Channel, ChannelContainer, LoopbackChannel, TransportType};
pub use filter::NetworkFilter;
pub use limiter::BandwidthLimiter;
pub use messages::{
    parse_buffer, Message, MessageHeader, MessageType, ParseStatus, ProtocolInfo, TelemetryData,
    HEADER_SIZE,
};
pub use syn_cookies::SynCookies;

/// Pairs per outgoing confirm_req.
pub const CONFIRM_REQ_HASHES_MAX: usize = 7;
/// Hashes per generated confirm_ack vote.
pub const CONFIRM_ACK_HASHES_MAX: usize = 12;

const PUBLISH_FILTER_SIZE: usize = 256 * 1024;
const MAX_COOKIES_PER_IP: usize = 32;

type Inbound = dyn Fn(Message, Arc<dyn Channel>) + Send + Sync;
type ChannelObserver = dyn Fn(Arc<dyn Channel>) + Send + Sync;

/// Convert a socket address to the persisted endpoint form (v4 is mapped).
pub fn endpoint_key(address: &SocketAddr) -> EndpointKey {
    let v6 = match address.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    EndpointKey::new(v6.octets(), address.port())
}

/// Back from the persisted form; mapped addresses come out as v4.
pub fn socket_addr(key: &EndpointKey) -> SocketAddr {
    let v6 = std::net::Ipv6Addr::from(key.address);
    match v6.to_ipv4() {
        Some(v4) if v6.to_ipv4_mapped().is_some() => SocketAddr::new(IpAddr::V4(v4), key.port),
        _ => SocketAddr::new(IpAddr::V6(v6), key.port),
    }
}

/// The realtime network: peer set, flood primitives and the inbound hook.
pub struct Network {
    pub protocol: ProtocolInfo,
    pub channels: Arc<ChannelContainer>,
    pub limiter: Arc<BandwidthLimiter>,
    pub publish_filter: Arc<NetworkFilter>,
    pub syn_cookies: SynCookies,
    node_id: KeyPair,
    port: AtomicU16,
    stopped: AtomicBool,
    inbound: Mutex<Option<Arc<Inbound>>>,
    channel_observer: Mutex<Option<Arc<ChannelObserver>>>,
    listener_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Network {
    /// `bandwidth_limit` of zero disables the limiter.
    pub fn new(params: &NetworkParams, port: u16, bandwidth_limit: usize) -> Arc<Self> {
        Arc::new(Network {
            protocol: ProtocolInfo::new(&params.network),
            channels: Arc::new(ChannelContainer::default()),
            limiter: Arc::new(BandwidthLimiter::new(1.25, bandwidth_limit)),
            publish_filter: Arc::new(NetworkFilter::new(PUBLISH_FILTER_SIZE)),
            syn_cookies: SynCookies::new(MAX_COOKIES_PER_IP),
            node_id: KeyPair::generate(),
            port: AtomicU16::new(port),
            stopped: AtomicBool::new(false),
            inbound: Mutex::new(None),
            channel_observer: Mutex::new(None),
            listener_thread: Mutex::new(None),
        })
    }

    /// Bind and start accepting; port zero picks an ephemeral port which is
    /// readable from [`Network::port`] afterwards.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", self.port.load(Ordering::SeqCst)))?;
        let local = listener.local_addr()?;
        self.port.store(local.port(), Ordering::SeqCst);
        info!(target: "network", "listening on {}", local);
        let network = self.clone();
        let handle = std::thread::Builder::new()
            .name("io".to_string())
            .spawn(move || tcp::run_listener(network, listener))
            .expect("listener thread spawn");
        *self.listener_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in self.channels.all() {
            channel.close();
        }
        // Unblock the accept loop.
        let _ = std::net::TcpStream::connect(("127.0.0.1", self.port.load(Ordering::SeqCst)));
        if let Some(handle) = self.listener_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &KeyPair {
        &self.node_id
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), self.port())
    }

    pub fn set_inbound(&self, inbound: Arc<Inbound>) {
        *self.inbound.lock() = Some(inbound);
    }

    pub fn set_channel_observer(&self, observer: Arc<ChannelObserver>) {
        *self.channel_observer.lock() = Some(observer);
    }

    pub(crate) fn notify_channel_observer(&self, channel: Arc<dyn Channel>) {
        let observer = self.channel_observer.lock().clone();
        if let Some(observer) = observer {
            observer(channel);
        }
    }

    /// Deliver a parsed realtime message to the node.
    pub fn process(&self, message: Message, channel: Arc<dyn Channel>) {
        let inbound = self.inbound.lock().clone();
        match inbound {
            Some(inbound) => inbound(message, channel),
            None => debug!(target: "network", "inbound not attached; dropping {:?}", message.message_type()),
        }
    }

    pub fn connect(self: &Arc<Self>, endpoint: SocketAddr) {
        if !self.stopped() {
            tcp::connect(self.clone(), endpoint);
        }
    }

    /// Keepalive-driven peer discovery.
    pub fn merge_peers(self: &Arc<Self>, peers: &[EndpointKey]) {
        for key in peers {
            let endpoint = socket_addr(key);
            if key.port != 0
                && endpoint != self.endpoint()
                && self.channels.find(&endpoint).is_none()
            {
                self.connect(endpoint);
            }
        }
    }

    /// Flood to a random selection of peers; scale 1 reaches √n of them.
    pub fn flood_message(&self, message: &Message, policy: BufferDropPolicy, scale: f32) {
        for channel in self.channels.random_set(self.channels.fanout(scale)) {
            channel.send(message, policy);
        }
    }

    pub fn flood_block(&self, block: &Arc<Block>, policy: BufferDropPolicy) {
        self.flood_message(
            &Message::Publish {
                block: block.clone(),
                digest: 0,
            },
            policy,
            1.0,
        );
    }

    /// Initial publish: all given principal channels plus a random fanout.
    pub fn flood_block_initial(&self, block: &Arc<Block>, principals: &[Arc<dyn Channel>]) {
        let message = Message::Publish {
            block: block.clone(),
            digest: 0,
        };
        for channel in principals {
            channel.send(&message, BufferDropPolicy::NoLimiterDrop);
        }
        self.flood_message(&message, BufferDropPolicy::NoLimiterDrop, 1.0);
    }

    pub fn flood_vote(&self, vote: &Arc<Vote>, scale: f32) {
        self.flood_message(
            &Message::ConfirmAck { vote: vote.clone() },
            BufferDropPolicy::Limiter,
            scale,
        );
    }

    /// Eight random realtime endpoints for a keepalive payload.
    pub fn random_fill(&self) -> Vec<EndpointKey> {
        self.channels
            .random_set(messages::KEEPALIVE_PEERS)
            .iter()
            .map(|channel| endpoint_key(&channel.endpoint()))
            .collect()
    }

    pub fn flood_keepalive(&self) {
        let message = Message::Keepalive {
            peers: self.random_fill(),
        };
        for channel in self.channels.all() {
            channel.send(&message, BufferDropPolicy::Limiter);
        }
    }

    /// Purge idle channels and stale handshake cookies.
    pub fn cleanup(&self, cutoff: Instant, cookie_cutoff: Instant) {
        for channel in self.channels.purge(cutoff) {
            debug!(target: "network", "purging idle channel {}", channel.endpoint());
            channel.close();
        }
        self.syn_cookies.purge(cookie_cutoff);
    }

    /// Find the realtime channel of a representative by node id.
    pub fn find_node_id(&self, node_id: &Account) -> Option<Arc<dyn Channel>> {
        self.channels.find_node_id(node_id)
    }
}
