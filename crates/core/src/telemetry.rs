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

//! Local telemetry assembly.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use lattice_network::{Network, TelemetryData};
use lattice_types::utils;

use crate::active_elections::ActiveElections;
use crate::ledger::Ledger;

pub struct Telemetry {
    ledger: Arc<Ledger>,
    network: Arc<Network>,
    active: Arc<ActiveElections>,
    bandwidth_cap: u64,
    start_time: Instant,
}

impl Telemetry {
    pub fn new(
        ledger: Arc<Ledger>,
        network: Arc<Network>,
        active: Arc<ActiveElections>,
        bandwidth_cap: u64,
    ) -> Self {
        Telemetry {
            ledger,
            network,
            active,
            bandwidth_cap,
            start_time: Instant::now(),
        }
    }

    /// A signed snapshot of this node's state.
    pub fn local_telemetry_data(&self) -> TelemetryData {
        let unchecked_count = {
            let txn = self.ledger.store.tx_begin_read();
            self.ledger.store.unchecked.count(&txn) as u64
        };
        let mut data = TelemetryData {
            node_id: self.network.node_id().public_key(),
            block_count: self.ledger.cache.block_count.load(Ordering::SeqCst),
            cemented_count: self.ledger.cache.cemented_count.load(Ordering::SeqCst),
            unchecked_count,
            account_count: self.ledger.cache.account_count.load(Ordering::SeqCst),
            bandwidth_cap: self.bandwidth_cap,
            peer_count: self.network.channels.len() as u32,
            protocol_version: self.network.protocol.version,
            uptime: self.start_time.elapsed().as_secs(),
            genesis_block: self.ledger.constants.genesis.hash(),
            timestamp: utils::seconds_since_epoch(),
            active_difficulty: self.active.active_difficulty(),
            ..Default::default()
        };
        data.sign(self.network.node_id().secret_key());
        data
    }
}
