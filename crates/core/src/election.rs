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

//! A single election over one qualified root.
//!
//! State machine: passive → active → confirmed → expired_confirmed, with
//! expired_unconfirmed for elections that exhaust their request budget.
//! Votes are tallied lazily per hash; the winner needs 34% of online weight,
//! and a quorum of *final* votes commits irrevocably.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use lattice_types::{
    Account, Amount, Block, BlockHash, NetworkParams, QualifiedRoot, Root, FINAL_FLAG,
};

use crate::config::NodeConfig;
use crate::confirmation_solicitor::ConfirmationSolicitor;
use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;
use crate::stats::{DetailType, StatType, Stats};
use crate::voting::VoteGenerator;
use crate::write_queue::{WriteQueue, Writer};

const PASSIVE_DURATION_FACTOR: u32 = 5;
const CONFIRMED_DURATION_FACTOR: u32 = 5;
/// Maximum simultaneous fork candidates per election.
pub const MAX_BLOCKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Passive,
    Active,
    Confirmed,
    ExpiredConfirmed,
    ExpiredUnconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStatusType {
    Ongoing,
    ActiveConfirmedQuorum,
    ActiveConfirmedQuorumFinal,
    Stopped,
}

/// Snapshot of an election's outcome.
#[derive(Clone)]
pub struct ElectionStatus {
    pub winner: Option<Arc<Block>>,
    pub tally: Amount,
    pub final_tally: Amount,
    pub block_count: u32,
    pub voter_count: u32,
    pub confirmation_request_count: u32,
    pub election_duration: Duration,
    pub status_type: ElectionStatusType,
}

impl Default for ElectionStatus {
    fn default() -> Self {
        ElectionStatus {
            winner: None,
            tally: Amount::zero(),
            final_tally: Amount::zero(),
            block_count: 0,
            voter_count: 0,
            confirmation_request_count: 0,
            election_duration: Duration::from_secs(0),
            status_type: ElectionStatusType::Ongoing,
        }
    }
}

/// A representative's latest accepted vote in this election.
#[derive(Debug, Clone)]
pub struct VoteInfo {
    pub time: Instant,
    pub timestamp: u64,
    pub hash: BlockHash,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ElectionVoteResult {
    pub replay: bool,
    pub processed: bool,
}

struct ElectionData {
    state: ElectionState,
    state_start: Instant,
    last_blocks: HashMap<BlockHash, Arc<Block>>,
    last_votes: HashMap<Account, VoteInfo>,
    last_tally: HashMap<BlockHash, Amount>,
    status: ElectionStatus,
    last_req: Option<Instant>,
    last_block_broadcast: Option<Instant>,
    last_vote_broadcast: Option<Instant>,
}

type ConfirmedAction = dyn Fn(ElectionStatus) + Send + Sync;

pub struct Election {
    pub root: Root,
    pub qualified_root: QualifiedRoot,
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    write_queue: Arc<WriteQueue>,
    generator: Arc<VoteGenerator>,
    final_generator: Arc<VoteGenerator>,
    stats: Arc<Stats>,
    config: NodeConfig,
    params: NetworkParams,
    confirmed_action: Box<ConfirmedAction>,
    data: Mutex<ElectionData>,
    pub confirmation_request_count: AtomicU32,
    election_start: Instant,
}

impl Election {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: Arc<Block>,
        ledger: Arc<Ledger>,
        online_reps: Arc<OnlineReps>,
        write_queue: Arc<WriteQueue>,
        generator: Arc<VoteGenerator>,
        final_generator: Arc<VoteGenerator>,
        stats: Arc<Stats>,
        config: NodeConfig,
        params: NetworkParams,
        confirmed_action: Box<ConfirmedAction>,
    ) -> Arc<Self> {
        let mut last_blocks = HashMap::new();
        let mut status = ElectionStatus::default();
        status.winner = Some(block.clone());
        status.block_count = 1;
        last_blocks.insert(block.hash(), block.clone());
        Arc::new(Election {
            root: block.root(),
            qualified_root: block.qualified_root(),
            ledger,
            online_reps,
            write_queue,
            generator,
            final_generator,
            stats,
            config,
            params,
            confirmed_action,
            data: Mutex::new(ElectionData {
                state: ElectionState::Passive,
                state_start: Instant::now(),
                last_blocks,
                last_votes: HashMap::new(),
                last_tally: HashMap::new(),
                status,
                last_req: None,
                last_block_broadcast: None,
                last_vote_broadcast: None,
            }),
            confirmation_request_count: AtomicU32::new(0),
            election_start: Instant::now(),
        })
    }

    fn base_latency(&self) -> Duration {
        self.params.network.base_latency
    }

    pub fn state(&self) -> ElectionState {
        self.data.lock().state
    }

    pub fn confirmed(&self) -> bool {
        matches!(
            self.state(),
            ElectionState::Confirmed | ElectionState::ExpiredConfirmed
        )
    }

    pub fn failed(&self) -> bool {
        self.state() == ElectionState::ExpiredUnconfirmed
    }

    pub fn winner(&self) -> Option<Arc<Block>> {
        self.data.lock().status.winner.clone()
    }

    pub fn current_status(&self) -> ElectionStatus {
        self.data.lock().status.clone()
    }

    pub fn votes(&self) -> HashMap<Account, VoteInfo> {
        self.data.lock().last_votes.clone()
    }

    pub fn blocks(&self) -> HashMap<BlockHash, Arc<Block>> {
        self.data.lock().last_blocks.clone()
    }

    pub fn find(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.data.lock().last_blocks.get(hash).cloned()
    }

    /// Move straight to actively requesting confirmations.
    pub fn transition_active(&self) {
        let mut data = self.data.lock();
        if data.state == ElectionState::Passive {
            data.state = ElectionState::Active;
            data.state_start = Instant::now();
        }
    }

    /// Count a representative's vote. Replays (equal or older timestamps)
    /// are rejected unless a final vote upgrades a non-final one for the
    /// same hash.
    pub fn vote(&self, rep: Account, timestamp: u64, hash: BlockHash) -> ElectionVoteResult {
        let confirmed = {
            let mut data = self.data.lock();
            if let Some(last) = data.last_votes.get(&rep) {
                let newer = (timestamp & !FINAL_FLAG) > (last.timestamp & !FINAL_FLAG);
                let final_upgrade = timestamp & FINAL_FLAG != 0
                    && last.timestamp & FINAL_FLAG == 0
                    && hash == last.hash
                    && (timestamp & !FINAL_FLAG) >= (last.timestamp & !FINAL_FLAG);
                if !newer && !final_upgrade {
                    return ElectionVoteResult {
                        replay: true,
                        processed: false,
                    };
                }
            }
            data.last_votes.insert(
                rep,
                VoteInfo {
                    time: Instant::now(),
                    timestamp,
                    hash,
                },
            );
            trace!(target: "election", "vote from {:?} for {:?}", rep, hash);
            if self.confirmed_locked(&data) {
                None
            } else {
                self.confirm_if_quorum(&mut data)
            }
        };
        if let Some(status) = confirmed {
            self.commit_final_quorum(&status);
            (self.confirmed_action)(status);
        }
        ElectionVoteResult {
            replay: false,
            processed: true,
        }
    }

    /// Admit a fork candidate. Returns `false` when the block was added or
    /// updated, `true` when the election is full and outweighed.
    pub fn publish(&self, block: Arc<Block>) -> bool {
        let mut data = self.data.lock();
        let hash = block.hash();
        if data.last_blocks.contains_key(&hash) {
            // Replacing the instance keeps signature/work updates.
            data.last_blocks.insert(hash, block);
            return false;
        }
        if data.last_blocks.len() >= MAX_BLOCKS && !self.replace_by_weight(&mut data, &hash) {
            return true;
        }
        data.last_blocks.insert(hash, block);
        data.status.block_count = data.last_blocks.len() as u32;
        false
    }

    // Evict the lowest-tallied block in favour of a heavier newcomer.
    fn replace_by_weight(&self, data: &mut ElectionData, incoming: &BlockHash) -> bool {
        let tallies = Self::tally_impl(&self.ledger, &data.last_votes);
        let incoming_tally = tallies
            .normal
            .get(incoming)
            .copied()
            .unwrap_or_else(Amount::zero);
        let lowest = data
            .last_blocks
            .keys()
            .map(|hash| {
                (
                    tallies
                        .normal
                        .get(hash)
                        .copied()
                        .unwrap_or_else(Amount::zero),
                    *hash,
                )
            })
            .min();
        match lowest {
            Some((lowest_tally, lowest_hash)) => {
                let winner = data
                    .status
                    .winner
                    .as_ref()
                    .map(|block| block.hash())
                    .unwrap_or_default();
                if incoming_tally > lowest_tally && lowest_hash != winner {
                    data.last_blocks.remove(&lowest_hash);
                    // Retire votes for the evicted block.
                    data.last_votes.retain(|_, vote| vote.hash != lowest_hash);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn confirmed_locked(&self, data: &ElectionData) -> bool {
        matches!(
            data.state,
            ElectionState::Confirmed | ElectionState::ExpiredConfirmed
        )
    }

    /// Per-hash tallies over the latest vote of each representative.
    pub fn tally(&self) -> HashMap<BlockHash, Amount> {
        let mut data = self.data.lock();
        let tallies = Self::tally_impl(&self.ledger, &data.last_votes);
        data.last_tally = tallies.normal.clone();
        tallies.normal
    }

    fn tally_impl(ledger: &Ledger, votes: &HashMap<Account, VoteInfo>) -> Tallies {
        let mut normal: HashMap<BlockHash, Amount> = HashMap::new();
        let mut final_: HashMap<BlockHash, Amount> = HashMap::new();
        for (rep, vote) in votes {
            let weight = ledger.weight(rep);
            if weight.is_zero() {
                continue;
            }
            let entry = normal.entry(vote.hash).or_insert_with(Amount::zero);
            *entry = entry.saturating_add(weight);
            if vote.timestamp & FINAL_FLAG != 0 {
                let entry = final_.entry(vote.hash).or_insert_with(Amount::zero);
                *entry = entry.saturating_add(weight);
            }
        }
        Tallies { normal, final_ }
    }

    // Winner selection: maximum tally, ties to the lowest hash.
    fn winner_of(tally: &HashMap<BlockHash, Amount>) -> Option<(BlockHash, Amount)> {
        tally
            .iter()
            .map(|(hash, amount)| (*amount, std::cmp::Reverse(*hash)))
            .max()
            .map(|(amount, reverse)| (reverse.0, amount))
    }

    pub fn have_quorum(&self, tally: &HashMap<BlockHash, Amount>) -> bool {
        Self::winner_of(tally)
            .map(|(_, amount)| amount >= self.online_reps.delta())
            .unwrap_or(false)
    }

    // Must be called with the data lock held; returns the status to publish
    // once the lock is released.
    fn confirm_if_quorum(&self, data: &mut ElectionData) -> Option<ElectionStatus> {
        let tallies = Self::tally_impl(&self.ledger, &data.last_votes);
        let (winner_hash, winner_tally) = Self::winner_of(&tallies.normal)?;
        data.last_tally = tallies.normal.clone();
        let final_tally = tallies
            .final_
            .get(&winner_hash)
            .copied()
            .unwrap_or_else(Amount::zero);
        // The winner must be a block this election has actually seen.
        let winner_block = data.last_blocks.get(&winner_hash)?.clone();
        let changed = data
            .status
            .winner
            .as_ref()
            .map(|block| block.hash() != winner_hash)
            .unwrap_or(true);
        if changed {
            data.status.winner = Some(winner_block.clone());
        }
        data.status.tally = winner_tally;
        data.status.final_tally = final_tally;
        let delta = self.online_reps.delta();
        if winner_tally < delta {
            return None;
        }
        let status_type = if final_tally >= delta {
            ElectionStatusType::ActiveConfirmedQuorumFinal
        } else {
            ElectionStatusType::ActiveConfirmedQuorum
        };
        Some(self.confirm_once(data, status_type))
    }

    // Lock order forbids taking the write slot under the election mutex, so
    // the final-quorum table write runs once the data lock is released.
    fn commit_final_quorum(&self, status: &ElectionStatus) {
        if status.status_type != ElectionStatusType::ActiveConfirmedQuorumFinal {
            return;
        }
        let winner_hash = match &status.winner {
            Some(winner) => winner.hash(),
            None => return,
        };
        let guard = self.write_queue.wait(Writer::Voting);
        let txn = self.ledger.store.tx_begin_write();
        self.ledger
            .store
            .final_vote
            .put(&txn, &self.qualified_root, &winner_hash);
        drop(txn);
        guard.release();
    }

    fn confirm_once(&self, data: &mut ElectionData, status_type: ElectionStatusType) -> ElectionStatus {
        debug_assert!(!self.confirmed_locked(data));
        data.state = ElectionState::Confirmed;
        data.state_start = Instant::now();
        data.status.status_type = status_type;
        data.status.voter_count = data.last_votes.len() as u32;
        data.status.block_count = data.last_blocks.len() as u32;
        data.status.confirmation_request_count =
            self.confirmation_request_count.load(Ordering::SeqCst);
        data.status.election_duration = self.election_start.elapsed();
        self.stats
            .inc(StatType::Election, DetailType::ElectionConfirmed);
        debug!(
            target: "election",
            "confirmed {:?} with tally {} ({:?})",
            data.status.winner.as_ref().map(|block| block.hash()),
            data.status.tally,
            status_type
        );
        data.status.clone()
    }

    /// Periodic drive from the request loop. Returns `true` when the
    /// election should be erased from the container.
    pub fn transition_time(&self, solicitor: &mut ConfirmationSolicitor) -> bool {
        let state = {
            let mut data = self.data.lock();
            match data.state {
                ElectionState::Passive => {
                    if data.state_start.elapsed()
                        > self.base_latency() * PASSIVE_DURATION_FACTOR
                    {
                        data.state = ElectionState::Active;
                        data.state_start = Instant::now();
                    }
                }
                ElectionState::Confirmed => {
                    if data.state_start.elapsed()
                        > self.base_latency() * CONFIRMED_DURATION_FACTOR
                    {
                        data.state = ElectionState::ExpiredConfirmed;
                    }
                }
                _ => {}
            }
            data.state
        };
        match state {
            ElectionState::Active => {
                self.broadcast_vote();
                self.broadcast_block(solicitor);
                self.send_confirm_req(solicitor);
                if self.confirmation_request_count.load(Ordering::SeqCst)
                    > self.config.confirmation_request_cap
                {
                    let mut data = self.data.lock();
                    if !self.confirmed_locked(&data) {
                        data.state = ElectionState::ExpiredUnconfirmed;
                        self.stats
                            .inc(StatType::Election, DetailType::ElectionExpired);
                        return true;
                    }
                }
                false
            }
            ElectionState::Confirmed => {
                // Grace window for late votes; keep soliciting nothing.
                false
            }
            ElectionState::ExpiredConfirmed | ElectionState::ExpiredUnconfirmed => true,
            ElectionState::Passive => false,
        }
    }

    // Ask the local representatives for a vote on the current winner.
    fn broadcast_vote(&self) {
        let (winner_hash, quorum_or_confirmed) = {
            let mut data = self.data.lock();
            let interval = self.base_latency();
            if data
                .last_vote_broadcast
                .map(|last| last.elapsed() < interval)
                .unwrap_or(false)
            {
                return;
            }
            data.last_vote_broadcast = Some(Instant::now());
            let winner = match &data.status.winner {
                Some(block) => block.hash(),
                None => return,
            };
            let tallies = Self::tally_impl(&self.ledger, &data.last_votes);
            let quorum = Self::winner_of(&tallies.normal)
                .map(|(_, amount)| amount >= self.online_reps.delta())
                .unwrap_or(false);
            (winner, quorum || self.confirmed_locked(&data))
        };
        if quorum_or_confirmed {
            self.final_generator.add(self.root, winner_hash);
        } else {
            self.generator.add(self.root, winner_hash);
        }
    }

    fn broadcast_block(&self, solicitor: &mut ConfirmationSolicitor) {
        let (winner, votes) = {
            let data = self.data.lock();
            let interval = self.base_latency() * 15;
            if data
                .last_block_broadcast
                .map(|last| last.elapsed() < interval)
                .unwrap_or(false)
            {
                return;
            }
            match &data.status.winner {
                Some(block) => (block.clone(), data.last_votes.clone()),
                None => return,
            }
        };
        if solicitor.broadcast(&winner, &votes).is_ok() {
            self.data.lock().last_block_broadcast = Some(Instant::now());
        }
    }

    fn send_confirm_req(&self, solicitor: &mut ConfirmationSolicitor) {
        let (winner_hash, votes) = {
            let data = self.data.lock();
            if data
                .last_req
                .map(|last| last.elapsed() < self.params.network.confirmation_request_delay)
                .unwrap_or(false)
            {
                return;
            }
            match &data.status.winner {
                Some(block) => (block.hash(), data.last_votes.clone()),
                None => return,
            }
        };
        if solicitor.add(winner_hash, self.root, &votes).is_ok() {
            self.confirmation_request_count.fetch_add(1, Ordering::SeqCst);
            self.data.lock().last_req = Some(Instant::now());
        }
    }

    /// Test-only shortcut past the voting process.
    pub fn force_confirm(&self) {
        let status = {
            let mut data = self.data.lock();
            if self.confirmed_locked(&data) {
                return;
            }
            Some(self.confirm_once(&mut data, ElectionStatusType::ActiveConfirmedQuorum))
        };
        if let Some(status) = status {
            (self.confirmed_action)(status);
        }
    }
}

struct Tallies {
    normal: HashMap<BlockHash, Amount>,
    final_: HashMap<BlockHash, Amount>,
}
