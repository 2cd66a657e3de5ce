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

//! OpenLattice core: ledger, block processing, elections, cementation,
//! voting and the components gluing them into a node.

pub mod active_elections;
pub mod block_processor;
pub mod config;
pub mod confirmation_height;
pub mod confirmation_solicitor;
pub mod election;
pub mod election_scheduler;
pub mod gap_cache;
pub mod ledger;
pub mod node;
pub mod observer_set;
pub mod online_reps;
pub mod rep_crawler;
pub mod request_aggregator;
pub mod signature_checker;
pub mod state_block_signature_verification;
pub mod stats;
pub mod telemetry;
pub mod unchecked_map;
pub mod vote_processor;
pub mod voting;
pub mod write_queue;

mod rep_weights;

#[cfg(test)]
pub(crate) mod test_utils;

pub use active_elections::{ActiveElections, VoteCode};
pub use block_processor::BlockProcessor;
pub use config::{NodeConfig, NodeFlags};
pub use confirmation_height::{ConfirmationHeightMode, ConfirmationHeightProcessor};
pub use election::{Election, ElectionState, ElectionStatus, ElectionStatusType};
pub use election_scheduler::ElectionScheduler;
pub use gap_cache::GapCache;
pub use ledger::{Ledger, LedgerCache, ProcessResult};
pub use node::Node;
pub use online_reps::OnlineReps;
pub use rep_crawler::{RepCrawler, Representative};
pub use request_aggregator::RequestAggregator;
pub use signature_checker::{SignatureCheckSet, SignatureChecker};
pub use stats::{DetailType, StatType, Stats};
pub use unchecked_map::UncheckedMap;
pub use vote_processor::VoteProcessor;
pub use voting::{LocalVoteHistory, VoteGenerator, VoteGeneratorSession, VoteSpacing};
pub use write_queue::{WriteGuard, WriteQueue, Writer};
