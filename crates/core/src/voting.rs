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

//! Local vote production.
//!
//! Candidates accumulate until a vote fills (12 hashes) or the delay
//! elapses, then one vote per configured representative key is signed and
//! handed to the broadcast action. Spacing keeps the node from voting twice
//! on one root within the configured window, and every produced vote lands
//! in the history cache for request aggregation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use lattice_network::Channel;
use lattice_types::{
    Account, BlockHash, KeyPair, NetworkParams, Root, Vote, FINAL_TIMESTAMP,
};

use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::stats::{DetailType, StatType, Stats};
use crate::write_queue::{WriteQueue, Writer};

/// Hashes per generated vote.
pub const MAX_HASHES: usize = 12;

/// Rejects a second vote for the same root inside the delay window.
pub struct VoteSpacing {
    delay: Duration,
    recent: HashMap<Root, (Instant, BlockHash)>,
}

impl VoteSpacing {
    pub fn new(delay: Duration) -> Self {
        VoteSpacing {
            delay,
            recent: HashMap::new(),
        }
    }

    /// A root is votable when it was never flagged, the window has passed,
    /// or the same hash is being re-affirmed.
    pub fn votable(&self, root: &Root, hash: &BlockHash) -> bool {
        match self.recent.get(root) {
            Some((time, voted_hash)) => {
                voted_hash == hash || time.elapsed() >= self.delay
            }
            None => true,
        }
    }

    pub fn flag(&mut self, root: Root, hash: BlockHash) {
        self.trim();
        self.recent.insert(root, (Instant::now(), hash));
    }

    pub fn size(&self) -> usize {
        self.recent.len()
    }

    fn trim(&mut self) {
        let delay = self.delay;
        self.recent.retain(|_, (time, _)| time.elapsed() < delay);
    }
}

struct LocalVote {
    hash: BlockHash,
    vote: Arc<Vote>,
}

/// Bounded cache of votes this node produced, newest roots kept.
pub struct LocalVoteHistory {
    max_cache: usize,
    history: Mutex<(VecDeque<Root>, HashMap<Root, Vec<LocalVote>>)>,
}

impl LocalVoteHistory {
    pub fn new(max_cache: usize) -> Self {
        LocalVoteHistory {
            max_cache,
            history: Mutex::new((VecDeque::new(), HashMap::new())),
        }
    }

    pub fn add(&self, root: Root, hash: BlockHash, vote: &Arc<Vote>) {
        let mut history = self.history.lock();
        let (order, map) = &mut *history;
        let entry = map.entry(root).or_insert_with(|| {
            order.push_back(root);
            Vec::new()
        });
        // Newer votes supersede older ones for a different hash.
        entry.retain(|existing| existing.hash == hash);
        entry.push(LocalVote {
            hash,
            vote: vote.clone(),
        });
        while order.len() > self.max_cache {
            if let Some(oldest) = order.pop_front() {
                map.remove(&oldest);
            }
        }
    }

    /// Cached votes for (root, hash); final-only when `is_final`.
    pub fn votes(&self, root: &Root, hash: &BlockHash, is_final: bool) -> Vec<Arc<Vote>> {
        let history = self.history.lock();
        history
            .1
            .get(root)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.hash == *hash && (!is_final || entry.vote.is_final()))
                    .map(|entry| entry.vote.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn exists(&self, root: &Root) -> bool {
        self.history.lock().1.contains_key(root)
    }

    pub fn erase(&self, root: &Root) {
        let mut history = self.history.lock();
        let (order, map) = &mut *history;
        map.remove(root);
        order.retain(|entry| entry != root);
    }

    pub fn size(&self) -> usize {
        self.history.lock().1.len()
    }
}

type Candidate = (Root, BlockHash);
type Request = (Vec<Candidate>, Arc<dyn Channel>);
type BroadcastAction = dyn Fn(Arc<Vote>) + Send + Sync;
type ReplyAction = dyn Fn(Arc<Vote>, Arc<dyn Channel>) + Send + Sync;

struct GeneratorState {
    candidates: VecDeque<Candidate>,
    /// Candidates deferred by spacing, with the time they become votable.
    spaced: VecDeque<(Instant, Candidate)>,
    requests: VecDeque<Request>,
    stopped: bool,
}

pub struct VoteGenerator {
    ledger: Arc<Ledger>,
    history: Arc<LocalVoteHistory>,
    spacing: Mutex<VoteSpacing>,
    write_queue: Arc<WriteQueue>,
    stats: Arc<Stats>,
    config: NodeConfig,
    params: NetworkParams,
    is_final: bool,
    keys: Vec<KeyPair>,
    state: Mutex<GeneratorState>,
    condition: Condvar,
    broadcast_action: Mutex<Option<Arc<BroadcastAction>>>,
    reply_action: Mutex<Option<Arc<ReplyAction>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VoteGenerator {
    pub fn new(
        ledger: Arc<Ledger>,
        history: Arc<LocalVoteHistory>,
        write_queue: Arc<WriteQueue>,
        stats: Arc<Stats>,
        config: NodeConfig,
        params: NetworkParams,
        is_final: bool,
    ) -> Arc<Self> {
        let generator = Arc::new(VoteGenerator {
            ledger,
            history,
            spacing: Mutex::new(VoteSpacing::new(params.voting.delay)),
            write_queue,
            stats,
            keys: config.representative_keys(),
            config,
            params,
            is_final,
            state: Mutex::new(GeneratorState {
                candidates: VecDeque::new(),
                spaced: VecDeque::new(),
                requests: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            broadcast_action: Mutex::new(None),
            reply_action: Mutex::new(None),
            thread: Mutex::new(None),
        });
        let run = generator.clone();
        let handle = std::thread::Builder::new()
            .name("voting".to_string())
            .spawn(move || run.run())
            .expect("vote generator thread spawn");
        *generator.thread.lock() = Some(handle);
        generator
    }

    /// Where produced broadcast votes go (flooding plus self-processing).
    pub fn set_broadcast_action(&self, action: Arc<BroadcastAction>) {
        *self.broadcast_action.lock() = Some(action);
    }

    /// Where reply votes go; set once by the request aggregator.
    pub fn set_reply_action(&self, action: Arc<ReplyAction>) {
        *self.reply_action.lock() = Some(action);
    }

    /// Queue (root, hash) for local vote generation, subject to ledger
    /// checks and spacing.
    pub fn add(&self, root: Root, hash: BlockHash) {
        if !self.should_vote(&root, &hash) {
            return;
        }
        {
            let mut spacing = self.spacing.lock();
            if !spacing.votable(&root, &hash) {
                self.stats
                    .inc(StatType::VoteGenerator, DetailType::GeneratorSpacing);
                // Defer rather than drop; the request stays owed.
                let mut state = self.state.lock();
                if !state.stopped {
                    state
                        .spaced
                        .push_back((Instant::now() + self.params.voting.delay, (root, hash)));
                }
                return;
            }
            spacing.flag(root, hash);
        }
        let notify = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if !state.candidates.contains(&(root, hash)) {
                state.candidates.push_back((root, hash));
            }
            state.candidates.len() >= MAX_HASHES
        };
        if notify {
            self.condition.notify_all();
        }
    }

    /// Queue blocks requested by a peer; returns accepted candidates.
    pub fn generate(&self, blocks: &[Arc<lattice_types::Block>], channel: Arc<dyn Channel>) -> usize {
        let candidates: Vec<Candidate> = blocks
            .iter()
            .map(|block| (block.root(), block.hash()))
            .filter(|(root, hash)| self.should_vote(root, hash))
            .collect();
        let count = candidates.len();
        if count > 0 {
            let mut state = self.state.lock();
            if !state.stopped {
                state.requests.push_back((candidates, channel));
                drop(state);
                self.condition.notify_all();
            }
        }
        count
    }

    fn should_vote(&self, root: &Root, hash: &BlockHash) -> bool {
        if self.keys.is_empty() {
            return false;
        }
        if self.is_final {
            // Final votes are gated on the canary and recorded irrevocably.
            if !self
                .ledger
                .cache
                .final_votes_confirmation_canary
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                return false;
            }
            let guard = self.write_queue.wait(Writer::Voting);
            let txn = self.ledger.store.tx_begin_write();
            let voteable = match self.ledger.store.block.get(&txn, hash) {
                Some(stored) => {
                    self.ledger.dependents_confirmed(&txn, &stored.block)
                        && self.ledger.store.final_vote.put(
                            &txn,
                            &stored.block.qualified_root(),
                            hash,
                        )
                }
                None => false,
            };
            drop(txn);
            guard.release();
            voteable
        } else {
            let txn = self.ledger.store.tx_begin_read();
            match self.ledger.store.block.get(&txn, hash) {
                Some(stored) => {
                    debug_assert!(stored.block.root() == *root);
                    self.ledger.dependents_confirmed(&txn, &stored.block)
                }
                None => false,
            }
        }
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                break;
            }
            // Deferred candidates release only into an empty batch.
            let now = Instant::now();
            while state.candidates.is_empty()
                && state
                    .spaced
                    .front()
                    .map(|(ready, _)| *ready <= now)
                    .unwrap_or(false)
            {
                let (_, (root, hash)) = state.spaced.pop_front().expect("non-empty deque");
                let mut spacing = self.spacing.lock();
                if spacing.votable(&root, &hash) {
                    spacing.flag(root, hash);
                    state.candidates.push_back((root, hash));
                }
            }
            if state.candidates.len() >= MAX_HASHES {
                drop(state);
                self.broadcast();
                state = self.state.lock();
            } else if let Some(request) = state.requests.pop_front() {
                drop(state);
                self.reply(request);
                state = self.state.lock();
            } else {
                let timeout = self.config.vote_generator_delay();
                let _ = self.condition.wait_for(&mut state, timeout);
                if !state.candidates.is_empty() && state.requests.is_empty() {
                    // Delay expired with a partial batch.
                    drop(state);
                    self.broadcast();
                    state = self.state.lock();
                }
            }
        }
    }

    fn take_candidates(&self) -> (Vec<Root>, Vec<BlockHash>) {
        let mut state = self.state.lock();
        let count = state.candidates.len().min(MAX_HASHES);
        let mut roots = Vec::with_capacity(count);
        let mut hashes = Vec::with_capacity(count);
        for (root, hash) in state.candidates.drain(..count) {
            roots.push(root);
            hashes.push(hash);
        }
        (roots, hashes)
    }

    fn broadcast(&self) {
        let (roots, hashes) = self.take_candidates();
        if hashes.is_empty() {
            return;
        }
        let action = self.broadcast_action.lock().clone();
        self.vote(&roots, &hashes, |vote| {
            if let Some(action) = &action {
                action(vote);
            }
            self.stats
                .inc(StatType::VoteGenerator, DetailType::GeneratorBroadcast);
        });
    }

    fn reply(&self, (candidates, channel): Request) {
        let action = self.reply_action.lock().clone();
        for chunk in candidates.chunks(MAX_HASHES) {
            let roots: Vec<Root> = chunk.iter().map(|(root, _)| *root).collect();
            let hashes: Vec<BlockHash> = chunk.iter().map(|(_, hash)| *hash).collect();
            self.vote(&roots, &hashes, |vote| {
                if let Some(action) = &action {
                    action(vote, channel.clone());
                }
                self.stats
                    .inc(StatType::VoteGenerator, DetailType::GeneratorReply);
            });
        }
    }

    fn vote(&self, roots: &[Root], hashes: &[BlockHash], action: impl Fn(Arc<Vote>)) {
        debug_assert!(roots.len() == hashes.len() && hashes.len() <= MAX_HASHES);
        let timestamp = if self.is_final {
            FINAL_TIMESTAMP
        } else {
            lattice_types::utils::seconds_since_epoch() << 4
        };
        for key in &self.keys {
            let vote = Arc::new(Vote::new(
                key.secret_key(),
                key.public_key(),
                timestamp,
                hashes.to_vec(),
            ));
            for (root, hash) in roots.iter().zip(hashes.iter()) {
                self.history.add(*root, *hash, &vote);
            }
            trace!(target: "voting", "generated vote for {} hashes (final={})", hashes.len(), self.is_final);
            action(vote);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VoteGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Batches additions so a burst of requests from one election round lands in
/// one vote.
pub struct VoteGeneratorSession {
    generator: Arc<VoteGenerator>,
    items: Vec<Candidate>,
}

impl VoteGeneratorSession {
    pub fn new(generator: Arc<VoteGenerator>) -> Self {
        VoteGeneratorSession {
            generator,
            items: Vec::new(),
        }
    }

    pub fn add(&mut self, root: Root, hash: BlockHash) {
        self.items.push((root, hash));
    }

    pub fn flush(&mut self) {
        for (root, hash) in self.items.drain(..) {
            self.generator.add(root, hash);
        }
    }
}

/// The node's voting keys; votes only make sense for keys with weight.
pub fn local_representatives(config: &NodeConfig, ledger: &Ledger, minimum: &lattice_types::Amount) -> Vec<Account> {
    config
        .representative_keys()
        .iter()
        .map(|key| key.public_key())
        .filter(|account| ledger.weight(account) >= *minimum)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_rejects_within_the_window() {
        let mut spacing = VoteSpacing::new(Duration::from_millis(100));
        let root = Root::repeat_byte(1);
        let hash_a = BlockHash::repeat_byte(2);
        let hash_b = BlockHash::repeat_byte(3);
        assert!(spacing.votable(&root, &hash_a));
        spacing.flag(root, hash_a);
        // Re-affirming the same hash is fine, switching is not.
        assert!(spacing.votable(&root, &hash_a));
        assert!(!spacing.votable(&root, &hash_b));
        std::thread::sleep(Duration::from_millis(120));
        assert!(spacing.votable(&root, &hash_b));
    }

    #[test]
    fn spacing_trims_expired_entries() {
        let mut spacing = VoteSpacing::new(Duration::from_millis(20));
        spacing.flag(Root::repeat_byte(1), BlockHash::repeat_byte(1));
        spacing.flag(Root::repeat_byte(2), BlockHash::repeat_byte(2));
        assert_eq!(spacing.size(), 2);
        std::thread::sleep(Duration::from_millis(30));
        spacing.flag(Root::repeat_byte(3), BlockHash::repeat_byte(3));
        assert_eq!(spacing.size(), 1);
    }

    #[test]
    fn history_caches_and_trims_by_root() {
        let key = KeyPair::generate();
        let history = LocalVoteHistory::new(2);
        let root_1 = Root::repeat_byte(1);
        let hash_1 = BlockHash::repeat_byte(11);
        let vote = Arc::new(Vote::new(key.secret_key(), key.public_key(), 1, vec![hash_1]));
        history.add(root_1, hash_1, &vote);
        assert!(history.exists(&root_1));
        assert_eq!(history.votes(&root_1, &hash_1, false).len(), 1);
        assert!(history.votes(&root_1, &hash_1, true).is_empty());
        assert!(history.votes(&root_1, &BlockHash::repeat_byte(9), false).is_empty());
        // Adding beyond the cap evicts the oldest root.
        history.add(Root::repeat_byte(2), BlockHash::repeat_byte(12), &vote);
        history.add(Root::repeat_byte(3), BlockHash::repeat_byte(13), &vote);
        assert_eq!(history.size(), 2);
        assert!(!history.exists(&root_1));
    }

    #[test]
    fn history_replaces_votes_for_a_different_hash() {
        let key = KeyPair::generate();
        let history = LocalVoteHistory::new(4);
        let root = Root::repeat_byte(1);
        let hash_a = BlockHash::repeat_byte(2);
        let hash_b = BlockHash::repeat_byte(3);
        let vote_a = Arc::new(Vote::new(key.secret_key(), key.public_key(), 1, vec![hash_a]));
        let vote_b = Arc::new(Vote::new(key.secret_key(), key.public_key(), 2, vec![hash_b]));
        history.add(root, hash_a, &vote_a);
        history.add(root, hash_b, &vote_b);
        assert!(history.votes(&root, &hash_a, false).is_empty());
        assert_eq!(history.votes(&root, &hash_b, false).len(), 1);
    }
}
