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

//! In-memory representative weights.
//!
//! Updated in lockstep with ledger application; a block moving balance
//! between representatives adjusts both under one lock acquisition so
//! readers never observe a torn total.

use std::collections::HashMap;

use ethereum_types::U128;
use parking_lot::Mutex;

use lattice_types::{Account, Amount};

#[derive(Default)]
pub struct RepWeights {
    rep_amounts: Mutex<HashMap<Account, Amount>>,
}

impl RepWeights {
    fn get_locked(amounts: &HashMap<Account, Amount>, account: &Account) -> Amount {
        amounts.get(account).copied().unwrap_or_else(U128::zero)
    }

    fn put_locked(amounts: &mut HashMap<Account, Amount>, account: Account, amount: Amount) {
        if amount.is_zero() {
            amounts.remove(&account);
        } else {
            amounts.insert(account, amount);
        }
    }

    /// Signed adjustment; saturates at zero like the original on rollback
    /// ordering edge cases.
    pub fn representation_add(&self, representative: Account, amount: Amount, subtract: bool) {
        let mut amounts = self.rep_amounts.lock();
        let previous = Self::get_locked(&amounts, &representative);
        let next = if subtract {
            previous.saturating_sub(amount)
        } else {
            previous.saturating_add(amount)
        };
        Self::put_locked(&mut amounts, representative, next);
    }

    /// Move both representatives' weights under one lock acquisition.
    pub fn representation_add_dual(
        &self,
        rep_1: Account,
        amount_1: Amount,
        subtract_1: bool,
        rep_2: Account,
        amount_2: Amount,
        subtract_2: bool,
    ) {
        if rep_1 != rep_2 {
            let mut amounts = self.rep_amounts.lock();
            let previous_1 = Self::get_locked(&amounts, &rep_1);
            let next_1 = if subtract_1 {
                previous_1.saturating_sub(amount_1)
            } else {
                previous_1.saturating_add(amount_1)
            };
            Self::put_locked(&mut amounts, rep_1, next_1);
            let previous_2 = Self::get_locked(&amounts, &rep_2);
            let next_2 = if subtract_2 {
                previous_2.saturating_sub(amount_2)
            } else {
                previous_2.saturating_add(amount_2)
            };
            Self::put_locked(&mut amounts, rep_2, next_2);
        } else if subtract_1 == subtract_2 {
            self.representation_add(rep_1, amount_1.saturating_add(amount_2), subtract_1);
        } else {
            let (add_amount, sub_amount) = if subtract_1 {
                (amount_2, amount_1)
            } else {
                (amount_1, amount_2)
            };
            if add_amount >= sub_amount {
                self.representation_add(rep_1, add_amount - sub_amount, false);
            } else {
                self.representation_add(rep_1, sub_amount - add_amount, true);
            }
        }
    }

    pub fn representation_get(&self, account: &Account) -> Amount {
        Self::get_locked(&self.rep_amounts.lock(), account)
    }

    pub fn representation_put(&self, account: Account, amount: Amount) {
        Self::put_locked(&mut self.rep_amounts.lock(), account, amount);
    }

    /// Snapshot of all weights.
    pub fn rep_amounts(&self) -> HashMap<Account, Amount> {
        self.rep_amounts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.rep_amounts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;

    #[test]
    fn add_and_subtract() {
        let weights = RepWeights::default();
        let rep = H256::repeat_byte(1);
        weights.representation_add(rep, U128::from(10u64), false);
        weights.representation_add(rep, U128::from(4u64), true);
        assert_eq!(weights.representation_get(&rep), U128::from(6u64));
    }

    #[test]
    fn dual_update_moves_weight() {
        let weights = RepWeights::default();
        let old_rep = H256::repeat_byte(1);
        let new_rep = H256::repeat_byte(2);
        weights.representation_put(old_rep, U128::from(100u64));
        weights.representation_add_dual(
            old_rep,
            U128::from(100u64),
            true,
            new_rep,
            U128::from(100u64),
            false,
        );
        assert_eq!(weights.representation_get(&old_rep), U128::zero());
        assert_eq!(weights.representation_get(&new_rep), U128::from(100u64));
    }

    #[test]
    fn dual_update_same_rep_collapses() {
        let weights = RepWeights::default();
        let rep = H256::repeat_byte(3);
        weights.representation_add_dual(rep, U128::from(5u64), false, rep, U128::from(7u64), false);
        assert_eq!(weights.representation_get(&rep), U128::from(12u64));
        weights.representation_add_dual(rep, U128::from(2u64), true, rep, U128::from(3u64), false);
        assert_eq!(weights.representation_get(&rep), U128::from(13u64));
    }

    #[test]
    fn zero_weights_are_dropped() {
        let weights = RepWeights::default();
        let rep = H256::repeat_byte(4);
        weights.representation_add(rep, U128::from(5u64), false);
        weights.representation_add(rep, U128::from(5u64), true);
        assert_eq!(weights.count(), 0);
    }
}
