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

//! Counter matrix for observability and tests.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatType {
    Ledger,
    BlockProcessor,
    Election,
    ConfirmationHeight,
    Vote,
    VoteGenerator,
    Aggregator,
    Message,
    Filter,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailType {
    All,
    Process,
    Old,
    Fork,
    GapPrevious,
    GapSource,
    BadSignature,
    InsufficientWork,
    ElectionStart,
    ElectionConfirmed,
    ElectionExpired,
    ElectionDropAll,
    BlockConfirmed,
    CementedBounded,
    CementedUnbounded,
    VoteValid,
    VoteInvalid,
    VoteReplay,
    VoteIndeterminate,
    VoteOverflow,
    GeneratorBroadcast,
    GeneratorReply,
    GeneratorSpacing,
    AggregatorAccepted,
    AggregatorDropped,
    AggregatorCachedHashes,
    AggregatorCachedVotes,
    RequestsGenerated,
    RequestsFinal,
    RequestsUnknown,
    Keepalive,
    Publish,
    ConfirmReq,
    ConfirmAck,
    Telemetry,
    Duplicate,
}

/// Thread-safe counters keyed by (type, detail).
#[derive(Default)]
pub struct Stats {
    counters: Mutex<HashMap<(StatType, DetailType), u64>>,
}

impl Stats {
    pub fn inc(&self, stat_type: StatType, detail: DetailType) {
        self.add(stat_type, detail, 1);
    }

    pub fn add(&self, stat_type: StatType, detail: DetailType, value: u64) {
        *self.counters.lock().entry((stat_type, detail)).or_insert(0) += value;
    }

    pub fn count(&self, stat_type: StatType, detail: DetailType) -> u64 {
        self.counters
            .lock()
            .get(&(stat_type, detail))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        assert_eq!(stats.count(StatType::Ledger, DetailType::Process), 0);
        stats.inc(StatType::Ledger, DetailType::Process);
        stats.add(StatType::Ledger, DetailType::Process, 2);
        stats.inc(StatType::Ledger, DetailType::Old);
        assert_eq!(stats.count(StatType::Ledger, DetailType::Process), 3);
        assert_eq!(stats.count(StatType::Ledger, DetailType::Old), 1);
    }
}
