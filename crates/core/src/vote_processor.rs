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

//! Ingestion of remote votes.
//!
//! The queue is bounded; as it fills, votes from lighter representatives are
//! shed first (random early detection over three weight tiers at 50/75/90%
//! occupancy). Signatures are verified in batches before dispatch to the
//! election container.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use ethereum_types::{U128, U256};
use log::trace;
use parking_lot::{Condvar, Mutex, RwLock};

use lattice_network::Channel;
use lattice_types::{Account, Amount, Vote, VoteUniquer};

use crate::active_elections::{ActiveElections, VoteCode};
use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::observer_set::ObserverSet;
use crate::online_reps::OnlineReps;
use crate::rep_crawler::RepCrawler;
use crate::signature_checker::{SignatureCheckSet, SignatureChecker};
use crate::stats::{DetailType, StatType, Stats};

const TIER_RECALC_INTERVAL_VOTES: u64 = 10_000;

struct Tiers {
    /// ≥ 0.1% of the weight base.
    tier_1: HashSet<Account>,
    /// ≥ 1%.
    tier_2: HashSet<Account>,
    /// ≥ 5%.
    tier_3: HashSet<Account>,
    last_calculated: Instant,
}

struct Queue {
    votes: VecDeque<(Arc<Vote>, Option<Arc<dyn Channel>>)>,
    stopped: bool,
}

pub struct VoteProcessor {
    active: Arc<ActiveElections>,
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    rep_crawler: Arc<RepCrawler>,
    checker: Arc<SignatureChecker>,
    uniquer: Arc<VoteUniquer>,
    stats: Arc<Stats>,
    config: NodeConfig,
    max_votes: usize,
    queue: Mutex<Queue>,
    condition: Condvar,
    tiers: RwLock<Tiers>,
    total_processed: std::sync::atomic::AtomicU64,
    /// Fired once per verified vote with the container's verdict.
    pub vote_processed: ObserverSet<(Arc<Vote>, VoteCode)>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VoteProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active: Arc<ActiveElections>,
        ledger: Arc<Ledger>,
        online_reps: Arc<OnlineReps>,
        rep_crawler: Arc<RepCrawler>,
        checker: Arc<SignatureChecker>,
        uniquer: Arc<VoteUniquer>,
        stats: Arc<Stats>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let max_votes = config.vote_processor_capacity;
        let processor = Arc::new(VoteProcessor {
            active,
            ledger,
            online_reps,
            rep_crawler,
            checker,
            uniquer,
            stats,
            config,
            max_votes,
            queue: Mutex::new(Queue {
                votes: VecDeque::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
            tiers: RwLock::new(Tiers {
                tier_1: HashSet::new(),
                tier_2: HashSet::new(),
                tier_3: HashSet::new(),
                last_calculated: Instant::now(),
            }),
            total_processed: std::sync::atomic::AtomicU64::new(0),
            vote_processed: ObserverSet::default(),
            thread: Mutex::new(None),
        });
        processor.calculate_weights();
        let run = processor.clone();
        let handle = std::thread::Builder::new()
            .name("vote proc".to_string())
            .spawn(move || run.process_loop())
            .expect("vote processor thread spawn");
        *processor.thread.lock() = Some(handle);
        processor
    }

    /// Queue a vote for processing. Returns `false` when accepted.
    pub fn vote(&self, vote: Arc<Vote>, channel: Option<Arc<dyn Channel>>) -> bool {
        let mut queue = self.queue.lock();
        if queue.stopped {
            return true;
        }
        let occupancy = queue.votes.len();
        if occupancy >= self.max_votes {
            self.stats.inc(StatType::Vote, DetailType::VoteOverflow);
            return true;
        }
        // RED: shed light representatives as occupancy rises.
        let ratio = occupancy as f64 / self.max_votes as f64;
        if ratio >= 0.5 {
            let tiers = self.tiers.read();
            let account = &vote.account;
            let admit = if ratio >= 0.9 {
                tiers.tier_3.contains(account)
            } else if ratio >= 0.75 {
                tiers.tier_3.contains(account) || tiers.tier_2.contains(account)
            } else {
                tiers.tier_3.contains(account)
                    || tiers.tier_2.contains(account)
                    || tiers.tier_1.contains(account)
            };
            if !admit {
                self.stats.inc(StatType::Vote, DetailType::VoteOverflow);
                return true;
            }
        }
        queue.votes.push_back((vote, channel));
        drop(queue);
        self.condition.notify_all();
        false
    }

    pub fn size(&self) -> usize {
        self.queue.lock().votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn half_full(&self) -> bool {
        self.size() >= self.max_votes / 2
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Wait for the queue to drain.
    pub fn flush(&self) {
        let mut queue = self.queue.lock();
        while !queue.stopped && !queue.votes.is_empty() {
            self.condition.wait(&mut queue);
        }
        // One more cycle for the batch in flight.
        drop(queue);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    /// Recompute the weight tiers from the ledger.
    pub fn calculate_weights(&self) {
        let base = self
            .online_reps
            .trended()
            .max(self.config.online_weight_minimum)
            .max(self.ledger.constants.genesis_amount / U128::from(1000u64));
        let fraction = |divisor: u32| -> Amount {
            let wide = U256::from(base) / U256::from(divisor);
            U128::from(wide.low_u128())
        };
        let threshold_1 = fraction(1000);
        let threshold_2 = fraction(100);
        let threshold_3 = fraction(20);
        let mut tier_1 = HashSet::new();
        let mut tier_2 = HashSet::new();
        let mut tier_3 = HashSet::new();
        for (account, weight) in self.ledger.rep_amounts() {
            if weight >= threshold_3 {
                tier_3.insert(account);
            }
            if weight >= threshold_2 {
                tier_2.insert(account);
            }
            if weight >= threshold_1 {
                tier_1.insert(account);
            }
        }
        let mut tiers = self.tiers.write();
        tiers.tier_1 = tier_1;
        tiers.tier_2 = tier_2;
        tiers.tier_3 = tier_3;
        tiers.last_calculated = Instant::now();
    }

    fn process_loop(&self) {
        let mut queue = self.queue.lock();
        while !queue.stopped {
            if queue.votes.is_empty() {
                self.condition.notify_all();
                self.condition.wait(&mut queue);
                continue;
            }
            let batch: Vec<_> = queue.votes.drain(..).collect();
            drop(queue);
            self.verify_votes(batch);
            if self.total_processed() % TIER_RECALC_INTERVAL_VOTES < 64 {
                self.calculate_weights();
            }
            queue = self.queue.lock();
        }
    }

    fn verify_votes(&self, batch: Vec<(Arc<Vote>, Option<Arc<dyn Channel>>)>) {
        let mut check = SignatureCheckSet::new(
            batch
                .iter()
                .map(|(vote, _)| vote.hash().as_bytes().to_vec())
                .collect(),
            batch.iter().map(|(vote, _)| vote.account).collect(),
            batch.iter().map(|(vote, _)| vote.signature).collect(),
        );
        self.checker.verify(&mut check);
        for (index, (vote, channel)) in batch.into_iter().enumerate() {
            if check.verifications[index] {
                self.vote_blocking(vote, channel);
            } else {
                self.stats.inc(StatType::Vote, DetailType::VoteInvalid);
            }
        }
    }

    fn vote_blocking(&self, vote: Arc<Vote>, channel: Option<Arc<dyn Channel>>) {
        let vote = self.uniquer.unique(&vote);
        let code = self.active.vote(&vote);
        self.total_processed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match code {
            VoteCode::Vote => self.stats.inc(StatType::Vote, DetailType::VoteValid),
            VoteCode::Replay => self.stats.inc(StatType::Vote, DetailType::VoteReplay),
            VoteCode::Indeterminate => self
                .stats
                .inc(StatType::Vote, DetailType::VoteIndeterminate),
        }
        trace!(target: "vote", "{:?} from {:?}", code, vote.account);
        self.online_reps.observe(vote.account);
        if let Some(channel) = channel {
            self.rep_crawler.observe(vote.account, channel);
        }
        self.vote_processed.notify(&(vote, code));
    }

    pub fn stop(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.stopped {
                return;
            }
            queue.stopped = true;
        }
        self.condition.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VoteProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
