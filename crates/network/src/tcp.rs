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

//! TCP transport.
//!
//! Every connection starts with a cookie handshake in both directions; only
//! after the remote proves its node id is the connection promoted to a
//! realtime channel and handed to the message pipeline.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use lattice_types::sign_message;

use crate::channel::{BufferDropPolicy, Channel, ChannelState, TransportType};
use crate::messages::{Message, MessageHeader, MessageType, HEADER_SIZE};
use crate::Network;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
// payload_size is bounded by construction; this is a second line of defense.
const MAX_PAYLOAD: usize = 64 * 1024;

pub struct TcpChannel {
    state: ChannelState,
    endpoint: SocketAddr,
    stream: Mutex<TcpStream>,
    protocol: crate::messages::ProtocolInfo,
    limiter: Arc<crate::limiter::BandwidthLimiter>,
    channels: Arc<crate::channel::ChannelContainer>,
}

impl TcpChannel {
    fn new(endpoint: SocketAddr, stream: TcpStream, network: &Network) -> Self {
        TcpChannel {
            state: ChannelState::new(),
            endpoint,
            stream: Mutex::new(stream),
            protocol: network.protocol,
            limiter: network.limiter.clone(),
            channels: network.channels.clone(),
        }
    }
}

impl Channel for TcpChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn send(&self, message: &Message, policy: BufferDropPolicy) {
        let bytes = message.to_bytes(self.protocol);
        if policy == BufferDropPolicy::Limiter && self.limiter.should_drop(bytes.len()) {
            trace!(target: "network", "dropping {:?} to {} (bandwidth)", message.message_type(), self.endpoint);
            return;
        }
        let mut stream = self.stream.lock();
        if let Err(error) = stream.write_all(&bytes) {
            debug!(target: "network", "write to {} failed: {}", self.endpoint, error);
            self.channels.erase(&self.endpoint);
            return;
        }
        self.set_last_packet_sent(Instant::now());
    }

    fn close(&self) {
        let _ = self.stream.lock().shutdown(std::net::Shutdown::Both);
    }
}

fn send_raw(stream: &mut TcpStream, message: &Message, network: &Network) -> std::io::Result<()> {
    stream.write_all(&message.to_bytes(network.protocol))
}

// Fill `buffer` across read timeouts; `Ok(false)` means the network stopped.
fn read_full(network: &Network, stream: &mut TcpStream, buffer: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        if network.stopped() {
            return Ok(false);
        }
        match stream.read(&mut buffer[filled..]) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(count) => filled += count,
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(error) => return Err(error),
        }
    }
    Ok(true)
}

/// Accept loop; one thread per listening socket.
pub fn run_listener(network: Arc<Network>, listener: std::net::TcpListener) {
    listener
        .set_nonblocking(false)
        .expect("listener configuration");
    for stream in listener.incoming() {
        if network.stopped() {
            break;
        }
        match stream {
            Ok(stream) => {
                let network = network.clone();
                std::thread::Builder::new()
                    .name("io".to_string())
                    .spawn(move || run_connection(network, stream))
                    .expect("connection thread spawn");
            }
            Err(error) => {
                debug!(target: "network", "accept failed: {}", error);
                break;
            }
        }
    }
}

/// Initiate an outbound connection; the handshake runs on a fresh thread.
pub fn connect(network: Arc<Network>, endpoint: SocketAddr) {
    std::thread::Builder::new()
        .name("io".to_string())
        .spawn(move || match TcpStream::connect_timeout(&endpoint, Duration::from_secs(3)) {
            Ok(stream) => run_connection(network, stream),
            Err(error) => debug!(target: "network", "connect to {} failed: {}", endpoint, error),
        })
        .expect("connection thread spawn");
}

// Drives one connection from handshake through realtime until error or stop.
fn run_connection(network: Arc<Network>, mut stream: TcpStream) {
    let endpoint = match stream.peer_addr() {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .expect("socket configuration");

    // Challenge the remote immediately.
    if let Some(cookie) = network.syn_cookies.assign(endpoint) {
        let query = Message::NodeIdHandshake {
            query: Some(cookie),
            response: None,
        };
        if send_raw(&mut stream, &query, &network).is_err() {
            return;
        }
    }

    let mut channel: Option<Arc<TcpChannel>> = None;
    loop {
        if network.stopped() {
            break;
        }
        let mut header_bytes = [0u8; HEADER_SIZE];
        match read_full(&network, &mut stream, &mut header_bytes) {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
        let header = match MessageHeader::deserialize(&mut header_bytes.as_slice()) {
            Ok(header) => header,
            Err(_) => break,
        };
        if header.network_id != network.protocol.network_id {
            debug!(target: "network", "{}: wrong network id", endpoint);
            break;
        }
        if header.version_using < network.protocol.version_min {
            debug!(target: "network", "{}: outdated version {}", endpoint, header.version_using);
            break;
        }
        let payload_size = match header.payload_size() {
            Some(size) if size <= MAX_PAYLOAD => size,
            _ => break,
        };
        let mut payload = vec![0u8; payload_size];
        if payload_size > 0 {
            match read_full(&network, &mut stream, &mut payload) {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }
        // Flood protection: duplicate publishes die at the door.
        if header.message_type == MessageType::Publish {
            let (duplicate, digest) = network.publish_filter.apply(&payload);
            if duplicate {
                trace!(target: "network", "{}: duplicate publish", endpoint);
                continue;
            }
            match Message::deserialize(&header, &payload) {
                Ok(Message::Publish { block, .. }) => {
                    if let Some(channel) = &channel {
                        network.process(Message::Publish { block, digest }, channel.clone());
                    }
                    continue;
                }
                _ => break,
            }
        }
        let message = match Message::deserialize(&header, &payload) {
            Ok(message) => message,
            Err(error) => {
                debug!(target: "network", "{}: bad message: {}", endpoint, error);
                break;
            }
        };
        match message {
            Message::NodeIdHandshake { query, response } => {
                if let Some((account, signature)) = response {
                    if network.syn_cookies.validate(endpoint, &account, &signature)
                        && channel.is_none()
                    {
                        match stream.try_clone() {
                            Ok(write_half) => {
                                let new_channel =
                                    Arc::new(TcpChannel::new(endpoint, write_half, &network));
                                new_channel.set_node_id(account);
                                new_channel.set_network_version(header.version_using);
                                network.channels.insert(new_channel.clone());
                                network.notify_channel_observer(new_channel.clone());
                                channel = Some(new_channel);
                            }
                            Err(_) => break,
                        }
                    }
                }
                if let Some(cookie) = query {
                    let node_id = network.node_id();
                    let reply = Message::NodeIdHandshake {
                        query: None,
                        response: Some((
                            node_id.public_key(),
                            sign_message(node_id.secret_key(), &node_id.public_key(), cookie.as_bytes()),
                        )),
                    };
                    if send_raw(&mut stream, &reply, &network).is_err() {
                        break;
                    }
                }
            }
            message => {
                // Realtime traffic ahead of a completed handshake is dropped.
                if let Some(channel) = &channel {
                    channel.set_last_packet_received(Instant::now());
                    network.process(message, channel.clone());
                }
            }
        }
    }
    if let Some(channel) = channel {
        network.channels.erase(&channel.endpoint());
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}
