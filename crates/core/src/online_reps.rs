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

//! Online voting weight tracking.
//!
//! Representatives are considered online while they keep voting. The quorum
//! delta is 34% of the largest of: currently observed online weight, the
//! trended median of past samples, and the configured minimum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ethereum_types::{U128, U256};
use parking_lot::Mutex;

use lattice_types::{utils, Account, Amount, NetworkParams};

use crate::ledger::Ledger;

/// Percentage of online weight required for confirmation.
pub const ONLINE_WEIGHT_QUORUM: u32 = 34;

struct State {
    reps: HashMap<Account, Instant>,
    online: Amount,
    trended: Amount,
}

pub struct OnlineReps {
    ledger: Arc<Ledger>,
    params: NetworkParams,
    online_weight_minimum: Amount,
    state: Mutex<State>,
}

impl OnlineReps {
    pub fn new(ledger: Arc<Ledger>, params: NetworkParams, online_weight_minimum: Amount) -> Self {
        let trended = {
            let txn = ledger.store.tx_begin_read();
            Self::calculate_trend(&ledger, &params, online_weight_minimum, &txn)
        };
        OnlineReps {
            ledger,
            params,
            online_weight_minimum,
            state: Mutex::new(State {
                reps: HashMap::new(),
                online: U128::zero(),
                trended,
            }),
        }
    }

    /// Record activity by a representative with ledger weight.
    pub fn observe(&self, representative: Account) {
        if self.ledger.weight(&representative).is_zero() {
            return;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        state.reps.insert(representative, now);
        let period = self.params.node.weight_period;
        state.reps.retain(|_, last_seen| now.duration_since(*last_seen) < period);
        state.online = state
            .reps
            .keys()
            .fold(U128::zero(), |sum, rep| sum.saturating_add(self.ledger.weight(rep)));
    }

    /// Persist the current online weight and refresh the trend.
    pub fn sample(&self) {
        let online = self.online();
        let trended = {
            let txn = self.ledger.store.tx_begin_write();
            // Discard oldest samples beyond the window.
            while self.ledger.store.online_weight.count(&txn)
                >= self.params.node.max_weight_samples
            {
                let oldest = self.ledger.store.online_weight.iter(&txn).next();
                match oldest {
                    Some((time, _)) => self.ledger.store.online_weight.del(&txn, time),
                    None => break,
                }
            }
            self.ledger
                .store
                .online_weight
                .put(&txn, utils::seconds_since_epoch(), &online);
            Self::calculate_trend(&self.ledger, &self.params, self.online_weight_minimum, &txn)
        };
        self.state.lock().trended = trended;
    }

    fn calculate_trend(
        ledger: &Ledger,
        params: &NetworkParams,
        minimum: Amount,
        txn: &dyn lattice_db::Transaction,
    ) -> Amount {
        let mut items = Vec::with_capacity(params.node.max_weight_samples + 1);
        items.push(minimum);
        for (_, amount) in ledger.store.online_weight.iter(txn) {
            items.push(amount);
        }
        // Median of the sampled window.
        items.sort();
        items[items.len() / 2]
    }

    pub fn online(&self) -> Amount {
        self.state.lock().online
    }

    pub fn trended(&self) -> Amount {
        self.state.lock().trended
    }

    /// The confirmation threshold.
    pub fn delta(&self) -> Amount {
        let state = self.state.lock();
        let weight = state
            .online
            .max(state.trended)
            .max(self.online_weight_minimum);
        // Widen to keep full precision through the multiply.
        let wide = U256::from(weight) * U256::from(ONLINE_WEIGHT_QUORUM) / U256::from(100u32);
        if wide > U256::from(U128::max_value()) {
            U128::max_value()
        } else {
            U128::from(wide.low_u128())
        }
    }

    pub fn list(&self) -> Vec<Account> {
        self.state.lock().reps.keys().copied().collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.reps.clear();
        state.online = U128::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LedgerContext;
    use lattice_types::KeyPair;

    fn online_reps(ctx: &LedgerContext, minimum: u64) -> OnlineReps {
        OnlineReps::new(ctx.ledger.clone(), ctx.params.clone(), U128::from(minimum))
    }

    #[test]
    fn observe_tracks_weighted_reps_only() {
        let ctx = LedgerContext::new();
        let reps = online_reps(&ctx, 0);
        assert_eq!(reps.online(), U128::zero());
        let nobody = KeyPair::generate();
        reps.observe(nobody.public_key());
        assert_eq!(reps.online(), U128::zero());
        reps.observe(ctx.genesis_account());
        assert_eq!(reps.online(), ctx.params.ledger.genesis_amount);
        assert_eq!(reps.list(), vec![ctx.genesis_account()]);
        reps.clear();
        assert_eq!(reps.online(), U128::zero());
    }

    #[test]
    fn delta_is_34_percent_of_the_maximum() {
        let ctx = LedgerContext::new();
        let reps = online_reps(&ctx, 100);
        // Nothing online: the minimum rules.
        assert_eq!(reps.delta(), U128::from(34u64));
        reps.observe(ctx.genesis_account());
        let expected = {
            let wide = U256::from(ctx.params.ledger.genesis_amount) * U256::from(34u32)
                / U256::from(100u32);
            U128::from(wide.low_u128())
        };
        assert_eq!(reps.delta(), expected);
    }

    #[test]
    fn sample_persists_and_trends() {
        let ctx = LedgerContext::new();
        let reps = online_reps(&ctx, 0);
        reps.observe(ctx.genesis_account());
        reps.sample();
        {
            let txn = ctx.store.tx_begin_read();
            assert_eq!(ctx.store.online_weight.count(&txn), 1);
        }
        // Median of {0 (minimum), genesis} per the trend definition.
        assert_eq!(reps.trended(), ctx.params.ledger.genesis_amount);
    }
}
