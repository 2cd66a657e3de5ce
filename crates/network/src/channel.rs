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

//! Channel abstraction and the realtime channel set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use lattice_types::Account;

use crate::messages::Message;

/// What to do when an outbound buffer would exceed a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDropPolicy {
    /// Drop if either the bandwidth limiter or the socket queue is full.
    Limiter,
    /// Ignore the bandwidth limiter, drop only on a full socket queue.
    NoLimiterDrop,
    /// Never drop; used for handshakes and other must-deliver traffic.
    NoSocketDrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
    Loopback,
}

// Mutable channel attributes shared by every transport.
#[derive(Debug)]
pub struct ChannelState {
    last_packet_sent: Mutex<Instant>,
    last_packet_received: Mutex<Instant>,
    node_id: Mutex<Option<Account>>,
    network_version: Mutex<u8>,
}

impl ChannelState {
    pub fn new() -> Self {
        ChannelState {
            last_packet_sent: Mutex::new(Instant::now()),
            last_packet_received: Mutex::new(Instant::now()),
            node_id: Mutex::new(None),
            network_version: Mutex::new(0),
        }
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

/// One remote peer (or the local loopback) able to receive messages.
pub trait Channel: Send + Sync {
    fn state(&self) -> &ChannelState;

    fn endpoint(&self) -> SocketAddr;

    fn transport_type(&self) -> TransportType;

    /// Queue a message; dropping silently is allowed per `policy`.
    fn send(&self, message: &Message, policy: BufferDropPolicy);

    fn close(&self) {}

    fn node_id(&self) -> Option<Account> {
        *self.state().node_id.lock()
    }

    fn set_node_id(&self, node_id: Account) {
        *self.state().node_id.lock() = Some(node_id);
    }

    fn network_version(&self) -> u8 {
        *self.state().network_version.lock()
    }

    fn set_network_version(&self, version: u8) {
        *self.state().network_version.lock() = version;
    }

    fn last_packet_sent(&self) -> Instant {
        *self.state().last_packet_sent.lock()
    }

    fn set_last_packet_sent(&self, time: Instant) {
        *self.state().last_packet_sent.lock() = time;
    }

    fn last_packet_received(&self) -> Instant {
        *self.state().last_packet_received.lock()
    }

    fn set_last_packet_received(&self, time: Instant) {
        *self.state().last_packet_received.lock() = time;
    }
}

type Inbound = dyn Fn(Message) + Send + Sync;

/// The node's own channel. Messages sent here are fed straight back into the
/// inbound pipeline; without a pipeline attached they are recorded, which is
/// what unit tests inspect.
pub struct LoopbackChannel {
    state: ChannelState,
    endpoint: SocketAddr,
    inbound: Mutex<Option<Arc<Inbound>>>,
    recorded: Mutex<Vec<Message>>,
}

impl LoopbackChannel {
    pub fn new(endpoint: SocketAddr) -> Self {
        LoopbackChannel {
            state: ChannelState::new(),
            endpoint,
            inbound: Mutex::new(None),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_inbound(&self, inbound: Arc<Inbound>) {
        *self.inbound.lock() = Some(inbound);
    }

    /// Messages accumulated while no inbound pipeline was attached.
    pub fn sent(&self) -> Vec<Message> {
        self.recorded.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.recorded.lock().clear();
    }
}

impl Channel for LoopbackChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }

    fn send(&self, message: &Message, _policy: BufferDropPolicy) {
        self.set_last_packet_sent(Instant::now());
        let inbound = self.inbound.lock().clone();
        match inbound {
            Some(inbound) => inbound(message.clone()),
            None => self.recorded.lock().push(message.clone()),
        }
    }
}

/// The realtime channel set, keyed by endpoint.
#[derive(Default)]
pub struct ChannelContainer {
    channels: Mutex<HashMap<SocketAddr, Arc<dyn Channel>>>,
}

impl ChannelContainer {
    /// Insert a realtime channel; an existing channel for the endpoint is
    /// replaced (the newest connection wins).
    pub fn insert(&self, channel: Arc<dyn Channel>) {
        self.channels.lock().insert(channel.endpoint(), channel);
    }

    pub fn erase(&self, endpoint: &SocketAddr) {
        self.channels.lock().remove(endpoint);
    }

    pub fn find(&self, endpoint: &SocketAddr) -> Option<Arc<dyn Channel>> {
        self.channels.lock().get(endpoint).cloned()
    }

    pub fn find_node_id(&self, node_id: &Account) -> Option<Arc<dyn Channel>> {
        self.channels
            .lock()
            .values()
            .find(|channel| channel.node_id().as_ref() == Some(node_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Desired flood fanout for a given scale.
    pub fn fanout(&self, scale: f32) -> usize {
        ((self.len() as f32).sqrt() * scale).ceil() as usize
    }

    pub fn list(&self, count: usize) -> Vec<Arc<dyn Channel>> {
        let channels = self.channels.lock();
        let mut result: Vec<_> = channels.values().cloned().collect();
        result.truncate(count);
        result
    }

    pub fn all(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// A random sample of `count` distinct channels.
    pub fn random_set(&self, count: usize) -> Vec<Arc<dyn Channel>> {
        let channels = self.channels.lock();
        channels
            .values()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Drop channels with no traffic since `cutoff`; returns the evicted
    /// channels so callers can close sockets.
    pub fn purge(&self, cutoff: Instant) -> Vec<Arc<dyn Channel>> {
        let mut channels = self.channels.lock();
        let stale: Vec<SocketAddr> = channels
            .iter()
            .filter(|(_, channel)| {
                channel.last_packet_sent() < cutoff && channel.last_packet_received() < cutoff
            })
            .map(|(endpoint, _)| *endpoint)
            .collect();
        stale
            .into_iter()
            .filter_map(|endpoint| channels.remove(&endpoint))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn loopback_records_without_inbound() {
        let channel = LoopbackChannel::new(endpoint(9000));
        channel.send(&Message::TelemetryReq, BufferDropPolicy::Limiter);
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn loopback_forwards_with_inbound() {
        let channel = LoopbackChannel::new(endpoint(9001));
        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = seen.clone();
        channel.set_inbound(Arc::new(move |_message| {
            *seen_clone.lock() += 1;
        }));
        channel.send(&Message::TelemetryReq, BufferDropPolicy::Limiter);
        assert_eq!(*seen.lock(), 1);
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn container_replaces_by_endpoint() {
        let container = ChannelContainer::default();
        container.insert(Arc::new(LoopbackChannel::new(endpoint(1))));
        container.insert(Arc::new(LoopbackChannel::new(endpoint(1))));
        container.insert(Arc::new(LoopbackChannel::new(endpoint(2))));
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn find_by_node_id() {
        let container = ChannelContainer::default();
        let channel = Arc::new(LoopbackChannel::new(endpoint(3)));
        let id = Account::repeat_byte(9);
        channel.set_node_id(id);
        container.insert(channel);
        container.insert(Arc::new(LoopbackChannel::new(endpoint(4))));
        assert_eq!(container.find_node_id(&id).unwrap().endpoint(), endpoint(3));
        assert!(container.find_node_id(&Account::repeat_byte(1)).is_none());
    }

    #[test]
    fn purge_removes_idle_channels() {
        let container = ChannelContainer::default();
        let stale = Arc::new(LoopbackChannel::new(endpoint(5)));
        let past = Instant::now() - std::time::Duration::from_secs(600);
        stale.set_last_packet_sent(past);
        stale.set_last_packet_received(past);
        container.insert(stale);
        container.insert(Arc::new(LoopbackChannel::new(endpoint(6))));
        let evicted = container.purge(Instant::now() - std::time::Duration::from_secs(60));
        assert_eq!(evicted.len(), 1);
        assert_eq!(container.len(), 1);
        assert!(container.find(&endpoint(6)).is_some());
    }

    #[test]
    fn fanout_is_sqrt_of_size() {
        let container = ChannelContainer::default();
        for port in 0..16 {
            container.insert(Arc::new(LoopbackChannel::new(endpoint(port))));
        }
        assert_eq!(container.fanout(1.0), 4);
        assert_eq!(container.fanout(0.5), 2);
    }

    #[test]
    fn random_set_is_bounded_and_distinct() {
        let container = ChannelContainer::default();
        for port in 0..8 {
            container.insert(Arc::new(LoopbackChannel::new(endpoint(port))));
        }
        let sample = container.random_set(4);
        assert_eq!(sample.len(), 4);
        let mut endpoints: Vec<_> = sample.iter().map(|channel| channel.endpoint()).collect();
        endpoints.sort();
        endpoints.dedup();
        assert_eq!(endpoints.len(), 4);
        assert_eq!(container.random_set(100).len(), 8);
    }
}
