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

//! Wire message taxonomy and codec.
//!
//! The 8-byte header is `{network_id, version_max, version_using,
//! version_min, type, extensions}`. Extensions carry the embedded block type
//! for publish/confirm_req, the hash count for confirm_ack, the handshake
//! query/response flags, and the telemetry payload size.

use std::io;
use std::io::Read;
use std::sync::Arc;

use lattice_types::{
    utils, Account, Block, BlockHash, BlockType, EndpointKey, NetworkConstants, Root, Signature,
    Vote,
};

/// Protocol identity stamped on every outgoing header.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolInfo {
    pub network_id: u16,
    pub version: u8,
    pub version_min: u8,
}

impl ProtocolInfo {
    pub fn new(constants: &NetworkConstants) -> Self {
        ProtocolInfo {
            network_id: constants.id(),
            version: constants.protocol_version,
            version_min: constants.protocol_version_min,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    NotAType = 1,
    Keepalive = 2,
    Publish = 3,
    ConfirmReq = 4,
    ConfirmAck = 5,
    BulkPull = 6,
    BulkPush = 7,
    FrontierReq = 8,
    NodeIdHandshake = 10,
    BulkPullAccount = 11,
    TelemetryReq = 12,
    TelemetryAck = 13,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            0 => Some(MessageType::Invalid),
            1 => Some(MessageType::NotAType),
            2 => Some(MessageType::Keepalive),
            3 => Some(MessageType::Publish),
            4 => Some(MessageType::ConfirmReq),
            5 => Some(MessageType::ConfirmAck),
            6 => Some(MessageType::BulkPull),
            7 => Some(MessageType::BulkPush),
            8 => Some(MessageType::FrontierReq),
            10 => Some(MessageType::NodeIdHandshake),
            11 => Some(MessageType::BulkPullAccount),
            12 => Some(MessageType::TelemetryReq),
            13 => Some(MessageType::TelemetryAck),
            _ => None,
        }
    }
}

const BLOCK_TYPE_MASK: u16 = 0x0f00;
const COUNT_MASK: u16 = 0xf000;
const TELEMETRY_SIZE_MASK: u16 = 0x3ff;
const QUERY_FLAG: u16 = 0x0001;
const RESPONSE_FLAG: u16 = 0x0002;

pub const HEADER_SIZE: usize = 8;
/// Endpoints carried by a keepalive.
pub const KEEPALIVE_PEERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub network_id: u16,
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub extensions: u16,
}

impl MessageHeader {
    pub fn new(protocol: ProtocolInfo, message_type: MessageType) -> Self {
        MessageHeader {
            network_id: protocol.network_id,
            version_max: protocol.version,
            version_using: protocol.version,
            version_min: protocol.version_min,
            message_type,
            extensions: 0,
        }
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        stream.write_all(&self.network_id.to_be_bytes())?;
        stream.write_all(&[
            self.version_max,
            self.version_using,
            self.version_min,
            self.message_type as u8,
        ])?;
        stream.write_all(&self.extensions.to_le_bytes())
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        stream.read_exact(&mut bytes)?;
        let message_type = MessageType::from_u8(bytes[5])
            .ok_or_else(|| utils::invalid_data("message type"))?;
        Ok(MessageHeader {
            network_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            version_max: bytes[2],
            version_using: bytes[3],
            version_min: bytes[4],
            message_type,
            extensions: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u8(((self.extensions & BLOCK_TYPE_MASK) >> 8) as u8)
    }

    pub fn set_block_type(&mut self, block_type: BlockType) {
        self.extensions = (self.extensions & !BLOCK_TYPE_MASK) | ((block_type as u16) << 8);
    }

    pub fn count(&self) -> usize {
        ((self.extensions & COUNT_MASK) >> 12) as usize
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count < 16);
        self.extensions = (self.extensions & !COUNT_MASK) | ((count as u16) << 12);
    }

    pub fn query_flag(&self) -> bool {
        self.extensions & QUERY_FLAG != 0
    }

    pub fn response_flag(&self) -> bool {
        self.extensions & RESPONSE_FLAG != 0
    }

    pub fn telemetry_size(&self) -> usize {
        (self.extensions & TELEMETRY_SIZE_MASK) as usize
    }

    /// Size of the payload following this header, or `None` when the header
    /// alone cannot tell (invalid embedded block type).
    pub fn payload_size(&self) -> Option<usize> {
        let size = match self.message_type {
            MessageType::Invalid | MessageType::NotAType => return None,
            MessageType::Keepalive => KEEPALIVE_PEERS * 18,
            MessageType::Publish => match self.block_type()? {
                BlockType::Invalid | BlockType::NotABlock => return None,
                block_type => Block::serialized_size(block_type),
            },
            MessageType::ConfirmReq => match self.block_type()? {
                BlockType::Invalid => return None,
                BlockType::NotABlock => self.count() * 64,
                block_type => Block::serialized_size(block_type),
            },
            MessageType::ConfirmAck => 32 + 64 + 8 + self.count() * 32,
            MessageType::BulkPull => 32 + 32 + 4,
            MessageType::BulkPush => 0,
            MessageType::FrontierReq => 32 + 4 + 4,
            MessageType::NodeIdHandshake => {
                let mut size = 0;
                if self.query_flag() {
                    size += 32;
                }
                if self.response_flag() {
                    size += 32 + 64;
                }
                size
            }
            MessageType::BulkPullAccount => 32 + 16 + 1,
            MessageType::TelemetryReq => 0,
            MessageType::TelemetryAck => self.telemetry_size(),
        };
        Some(size)
    }
}

/// Self-reported node metrics, signed by the node id key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryData {
    pub node_id: Account,
    pub signature: Signature,
    pub block_count: u64,
    pub cemented_count: u64,
    pub unchecked_count: u64,
    pub account_count: u64,
    pub bandwidth_cap: u64,
    pub peer_count: u32,
    pub protocol_version: u8,
    pub uptime: u64,
    pub genesis_block: BlockHash,
    pub timestamp: u64,
    pub active_difficulty: u64,
}

impl TelemetryData {
    pub const SERIALIZED_SIZE: usize = 32 + 64 + 8 * 5 + 4 + 1 + 8 + 32 + 8 + 8;

    fn serialize_without_signature(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.node_id)?;
        utils::write_u64_be(stream, self.block_count)?;
        utils::write_u64_be(stream, self.cemented_count)?;
        utils::write_u64_be(stream, self.unchecked_count)?;
        utils::write_u64_be(stream, self.account_count)?;
        utils::write_u64_be(stream, self.bandwidth_cap)?;
        stream.write_all(&self.peer_count.to_be_bytes())?;
        stream.write_all(&[self.protocol_version])?;
        utils::write_u64_be(stream, self.uptime)?;
        utils::write_h256(stream, &self.genesis_block)?;
        utils::write_u64_be(stream, self.timestamp)?;
        utils::write_u64_be(stream, self.active_difficulty)
    }

    pub fn serialize(&self, stream: &mut dyn io::Write) -> io::Result<()> {
        utils::write_h256(stream, &self.node_id)?;
        utils::write_h512(stream, &self.signature)?;
        let mut rest = Vec::new();
        self.serialize_without_signature(&mut rest)?;
        // node_id leads the signed body as well; skip the duplicate.
        stream.write_all(&rest[32..])
    }

    pub fn deserialize(stream: &mut dyn io::Read) -> io::Result<Self> {
        let node_id = utils::read_h256(stream)?;
        let signature = utils::read_h512(stream)?;
        let block_count = utils::read_u64_be(stream)?;
        let cemented_count = utils::read_u64_be(stream)?;
        let unchecked_count = utils::read_u64_be(stream)?;
        let account_count = utils::read_u64_be(stream)?;
        let bandwidth_cap = utils::read_u64_be(stream)?;
        let mut peer_count = [0u8; 4];
        stream.read_exact(&mut peer_count)?;
        let mut protocol_version = [0u8; 1];
        stream.read_exact(&mut protocol_version)?;
        let uptime = utils::read_u64_be(stream)?;
        let genesis_block = utils::read_h256(stream)?;
        let timestamp = utils::read_u64_be(stream)?;
        let active_difficulty = utils::read_u64_be(stream)?;
        Ok(TelemetryData {
            node_id,
            signature,
            block_count,
            cemented_count,
            unchecked_count,
            account_count,
            bandwidth_cap,
            peer_count: u32::from_be_bytes(peer_count),
            protocol_version: protocol_version[0],
            uptime,
            genesis_block,
            timestamp,
            active_difficulty,
        })
    }

    pub fn sign(&mut self, secret: &lattice_types::RawKey) {
        let mut body = Vec::new();
        self.serialize_without_signature(&mut body).expect("vec write");
        self.signature = lattice_types::sign_message(secret, &self.node_id, &body);
    }

    pub fn validate_signature(&self) -> bool {
        let mut body = Vec::new();
        self.serialize_without_signature(&mut body).expect("vec write");
        lattice_types::validate_message(&self.node_id, &body, &self.signature)
    }
}

/// Parsed realtime message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Keepalive {
        peers: Vec<EndpointKey>,
    },
    Publish {
        block: Arc<Block>,
        /// Duplicate-filter digest, kept so a rejected block can be cleared
        /// for a retry.
        digest: u128,
    },
    ConfirmReq {
        block: Option<Arc<Block>>,
        roots_hashes: Vec<(BlockHash, Root)>,
    },
    ConfirmAck {
        vote: Arc<Vote>,
    },
    BulkPull {
        start: BlockHash,
        end: BlockHash,
        count: u32,
    },
    BulkPullAccount {
        account: Account,
        minimum_amount: lattice_types::Amount,
        flags: u8,
    },
    BulkPush,
    FrontierReq {
        start: Account,
        age: u32,
        count: u32,
    },
    NodeIdHandshake {
        query: Option<BlockHash>,
        response: Option<(Account, Signature)>,
    },
    TelemetryReq,
    TelemetryAck(TelemetryData),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keepalive { .. } => MessageType::Keepalive,
            Message::Publish { .. } => MessageType::Publish,
            Message::ConfirmReq { .. } => MessageType::ConfirmReq,
            Message::ConfirmAck { .. } => MessageType::ConfirmAck,
            Message::BulkPull { .. } => MessageType::BulkPull,
            Message::BulkPullAccount { .. } => MessageType::BulkPullAccount,
            Message::BulkPush => MessageType::BulkPush,
            Message::FrontierReq { .. } => MessageType::FrontierReq,
            Message::NodeIdHandshake { .. } => MessageType::NodeIdHandshake,
            Message::TelemetryReq => MessageType::TelemetryReq,
            Message::TelemetryAck(_) => MessageType::TelemetryAck,
        }
    }

    /// Serialize header plus payload.
    pub fn to_bytes(&self, protocol: ProtocolInfo) -> Vec<u8> {
        let mut header = MessageHeader::new(protocol, self.message_type());
        let mut payload = Vec::new();
        match self {
            Message::Keepalive { peers } => {
                debug_assert!(peers.len() <= KEEPALIVE_PEERS);
                for index in 0..KEEPALIVE_PEERS {
                    let endpoint = peers
                        .get(index)
                        .copied()
                        .unwrap_or_else(|| EndpointKey::new([0u8; 16], 0));
                    payload.extend_from_slice(&endpoint.to_bytes());
                }
            }
            Message::Publish { block, .. } => {
                header.set_block_type(block.block_type());
                block.serialize(&mut payload).expect("vec write");
            }
            Message::ConfirmReq {
                block,
                roots_hashes,
            } => match block {
                Some(block) => {
                    header.set_block_type(block.block_type());
                    block.serialize(&mut payload).expect("vec write");
                }
                None => {
                    header.set_block_type(BlockType::NotABlock);
                    header.set_count(roots_hashes.len());
                    for (hash, root) in roots_hashes {
                        payload.extend_from_slice(hash.as_bytes());
                        payload.extend_from_slice(root.as_bytes());
                    }
                }
            },
            Message::ConfirmAck { vote } => {
                header.set_block_type(BlockType::NotABlock);
                header.set_count(vote.hashes.len());
                vote.serialize(&mut payload).expect("vec write");
            }
            Message::BulkPull { start, end, count } => {
                payload.extend_from_slice(start.as_bytes());
                payload.extend_from_slice(end.as_bytes());
                payload.extend_from_slice(&count.to_le_bytes());
            }
            Message::BulkPullAccount {
                account,
                minimum_amount,
                flags,
            } => {
                payload.extend_from_slice(account.as_bytes());
                let mut amount = [0u8; 16];
                minimum_amount.to_big_endian(&mut amount);
                payload.extend_from_slice(&amount);
                payload.push(*flags);
            }
            Message::BulkPush => {}
            Message::FrontierReq { start, age, count } => {
                payload.extend_from_slice(start.as_bytes());
                payload.extend_from_slice(&age.to_le_bytes());
                payload.extend_from_slice(&count.to_le_bytes());
            }
            Message::NodeIdHandshake { query, response } => {
                if let Some(cookie) = query {
                    header.extensions |= QUERY_FLAG;
                    payload.extend_from_slice(cookie.as_bytes());
                }
                if let Some((account, signature)) = response {
                    header.extensions |= RESPONSE_FLAG;
                    payload.extend_from_slice(account.as_bytes());
                    payload.extend_from_slice(signature.as_bytes());
                }
            }
            Message::TelemetryReq => {}
            Message::TelemetryAck(data) => {
                data.serialize(&mut payload).expect("vec write");
                header.extensions |= (payload.len() as u16) & TELEMETRY_SIZE_MASK;
            }
        }
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        header.serialize(&mut bytes).expect("vec write");
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Deserialize the payload for an already-read header.
    pub fn deserialize(header: &MessageHeader, payload: &[u8]) -> io::Result<Message> {
        let mut stream = payload;
        let message = match header.message_type {
            MessageType::Invalid | MessageType::NotAType => {
                return Err(utils::invalid_data("message type"))
            }
            MessageType::Keepalive => {
                let mut peers = Vec::with_capacity(KEEPALIVE_PEERS);
                for _ in 0..KEEPALIVE_PEERS {
                    let mut bytes = [0u8; 18];
                    stream.read_exact(&mut bytes)?;
                    peers.push(EndpointKey::from_bytes(&bytes)?);
                }
                Message::Keepalive { peers }
            }
            MessageType::Publish => {
                let block_type = header
                    .block_type()
                    .ok_or_else(|| utils::invalid_data("block type"))?;
                let block = Block::deserialize(block_type, &mut stream)?;
                Message::Publish {
                    block: Arc::new(block),
                    digest: 0,
                }
            }
            MessageType::ConfirmReq => {
                let block_type = header
                    .block_type()
                    .ok_or_else(|| utils::invalid_data("block type"))?;
                if block_type == BlockType::NotABlock {
                    let mut roots_hashes = Vec::with_capacity(header.count());
                    for _ in 0..header.count() {
                        let hash = utils::read_h256(&mut stream)?;
                        let root = utils::read_h256(&mut stream)?;
                        roots_hashes.push((hash, root));
                    }
                    Message::ConfirmReq {
                        block: None,
                        roots_hashes,
                    }
                } else {
                    let block = Block::deserialize(block_type, &mut stream)?;
                    Message::ConfirmReq {
                        block: Some(Arc::new(block)),
                        roots_hashes: Vec::new(),
                    }
                }
            }
            MessageType::ConfirmAck => {
                let vote = Vote::deserialize(&mut stream, header.count())?;
                Message::ConfirmAck {
                    vote: Arc::new(vote),
                }
            }
            MessageType::BulkPull => {
                let start = utils::read_h256(&mut stream)?;
                let end = utils::read_h256(&mut stream)?;
                let mut count = [0u8; 4];
                stream.read_exact(&mut count)?;
                Message::BulkPull {
                    start,
                    end,
                    count: u32::from_le_bytes(count),
                }
            }
            MessageType::BulkPullAccount => {
                let account = utils::read_h256(&mut stream)?;
                let minimum_amount = utils::read_u128_be(&mut stream)?;
                let mut flags = [0u8; 1];
                stream.read_exact(&mut flags)?;
                Message::BulkPullAccount {
                    account,
                    minimum_amount,
                    flags: flags[0],
                }
            }
            MessageType::BulkPush => Message::BulkPush,
            MessageType::FrontierReq => {
                let start = utils::read_h256(&mut stream)?;
                let mut age = [0u8; 4];
                stream.read_exact(&mut age)?;
                let mut count = [0u8; 4];
                stream.read_exact(&mut count)?;
                Message::FrontierReq {
                    start,
                    age: u32::from_le_bytes(age),
                    count: u32::from_le_bytes(count),
                }
            }
            MessageType::NodeIdHandshake => {
                let query = if header.query_flag() {
                    Some(utils::read_h256(&mut stream)?)
                } else {
                    None
                };
                let response = if header.response_flag() {
                    let account = utils::read_h256(&mut stream)?;
                    let signature = utils::read_h512(&mut stream)?;
                    Some((account, signature))
                } else {
                    None
                };
                Message::NodeIdHandshake { query, response }
            }
            MessageType::TelemetryReq => Message::TelemetryReq,
            MessageType::TelemetryAck => Message::TelemetryAck(TelemetryData::deserialize(&mut stream)?),
        };
        Ok(message)
    }
}

/// Why a buffer failed to parse; protocol errors close the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    InvalidHeader,
    InvalidNetwork,
    OutdatedVersion,
    InvalidMessage,
    TrailingBytes,
}

/// Parse one complete datagram.
pub fn parse_buffer(protocol: ProtocolInfo, bytes: &[u8]) -> Result<Message, ParseStatus> {
    let mut stream = bytes;
    let header = MessageHeader::deserialize(&mut stream).map_err(|_| ParseStatus::InvalidHeader)?;
    if header.network_id != protocol.network_id {
        return Err(ParseStatus::InvalidNetwork);
    }
    if header.version_using < protocol.version_min {
        return Err(ParseStatus::OutdatedVersion);
    }
    let payload_size = header.payload_size().ok_or(ParseStatus::InvalidHeader)?;
    if stream.len() != payload_size {
        return Err(ParseStatus::TrailingBytes);
    }
    Message::deserialize(&header, stream).map_err(|_| ParseStatus::InvalidMessage)
}
