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

//! Representative discovery.
//!
//! Voting representatives are learned from the votes they send; the channel
//! a vote arrived on becomes the directed-request target for that account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ethereum_types::{U128, U256};
use parking_lot::Mutex;

use lattice_network::Channel;
use lattice_types::{Account, Amount};

use crate::ledger::Ledger;
use crate::online_reps::OnlineReps;

/// A representative with a live channel.
#[derive(Clone)]
pub struct Representative {
    pub account: Account,
    pub channel: Arc<dyn Channel>,
    pub last_response: Instant,
}

pub struct RepCrawler {
    ledger: Arc<Ledger>,
    online_reps: Arc<OnlineReps>,
    reps: Mutex<HashMap<Account, Representative>>,
}

impl RepCrawler {
    pub fn new(ledger: Arc<Ledger>, online_reps: Arc<OnlineReps>) -> Self {
        RepCrawler {
            ledger,
            online_reps,
            reps: Mutex::new(HashMap::new()),
        }
    }

    /// Register a voting representative seen on `channel`.
    pub fn observe(&self, account: Account, channel: Arc<dyn Channel>) {
        if self.ledger.weight(&account).is_zero() {
            return;
        }
        let mut reps = self.reps.lock();
        reps.insert(
            account,
            Representative {
                account,
                channel,
                last_response: Instant::now(),
            },
        );
    }

    /// Weight qualifying as a principal representative: 0.1% of the online
    /// stake floor.
    pub fn minimum_principal_weight(&self) -> Amount {
        let base = self.online_reps.trended();
        let wide = U256::from(base) / U256::from(1000u32);
        U128::from(wide.low_u128())
    }

    /// Known representatives above `minimum_weight`, heaviest first.
    pub fn representatives(&self, count: usize, minimum_weight: Amount) -> Vec<Representative> {
        let mut result: Vec<(Amount, Representative)> = self
            .reps
            .lock()
            .values()
            .filter_map(|rep| {
                let weight = self.ledger.weight(&rep.account);
                if weight >= minimum_weight {
                    Some((weight, rep.clone()))
                } else {
                    None
                }
            })
            .collect();
        result.sort_by(|a, b| b.0.cmp(&a.0));
        result
            .into_iter()
            .take(count)
            .map(|(_, rep)| rep)
            .collect()
    }

    pub fn principal_representatives(&self, count: usize) -> Vec<Representative> {
        self.representatives(count, self.minimum_principal_weight())
    }

    /// Drop representatives whose channel disappeared from the set.
    pub fn purge(&self, alive: impl Fn(&Arc<dyn Channel>) -> bool) {
        self.reps.lock().retain(|_, rep| alive(&rep.channel));
    }

    pub fn representative_count(&self) -> usize {
        self.reps.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LedgerContext;
    use lattice_network::LoopbackChannel;
    use lattice_types::KeyPair;

    fn channel(port: u16) -> Arc<dyn Channel> {
        Arc::new(LoopbackChannel::new(
            format!("127.0.0.1:{}", port).parse().unwrap(),
        ))
    }

    #[test]
    fn observes_weighted_representatives() {
        let ctx = LedgerContext::new();
        let online_reps = Arc::new(OnlineReps::new(
            ctx.ledger.clone(),
            ctx.params.clone(),
            U128::zero(),
        ));
        let crawler = RepCrawler::new(ctx.ledger.clone(), online_reps);
        let nobody = KeyPair::generate();
        crawler.observe(nobody.public_key(), channel(1));
        assert_eq!(crawler.representative_count(), 0);
        crawler.observe(ctx.genesis_account(), channel(2));
        assert_eq!(crawler.representative_count(), 1);
        let reps = crawler.representatives(10, U128::zero());
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].account, ctx.genesis_account());
    }

    #[test]
    fn purge_drops_dead_channels() {
        let ctx = LedgerContext::new();
        let online_reps = Arc::new(OnlineReps::new(
            ctx.ledger.clone(),
            ctx.params.clone(),
            U128::zero(),
        ));
        let crawler = RepCrawler::new(ctx.ledger.clone(), online_reps);
        crawler.observe(ctx.genesis_account(), channel(3));
        crawler.purge(|_| false);
        assert_eq!(crawler.representative_count(), 0);
    }
}
