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

//! Common types shared by every OpenLattice crate: wide integers and keys,
//! epochs, proof-of-work difficulty, the block variants with their sidebands,
//! votes, and the per-network constant tables.

pub mod blocks;
pub mod common;
pub mod constants;
pub mod difficulty;
pub mod epoch;
pub mod numbers;
pub mod utils;
pub mod vote;
pub mod work;

mod ed25519;

pub use blocks::{
    Block, BlockDetails, BlockSideband, BlockType, BlockUniquer, ChangeBlock, OpenBlock,
    ReceiveBlock, SendBlock, StateBlock, StoredBlock,
};
pub use common::{
    AccountInfo, ConfirmationHeightInfo, EndpointKey, PendingInfo, PendingKey,
    SignatureVerification, UncheckedInfo, UncheckedKey,
};
pub use constants::{
    LedgerConstants, NetworkConstants, NetworkParams, Networks, NodeConstants, VotingConstants,
};
pub use epoch::{Epoch, Epochs};
pub use numbers::{
    deterministic_key, sign_message, validate_message, validate_message_batch, Account, Amount,
    BlockHash, KeyPair, Link, QualifiedRoot, RawKey, Root, Signature,
};
pub use vote::{Vote, VoteUniquer, FINAL_FLAG, FINAL_TIMESTAMP, MAX_VOTE_HASHES};
pub use work::{work_value, WorkPool, WorkThresholds, WorkVersion};
