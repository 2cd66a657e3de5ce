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

//! Minimal observer registration.

use parking_lot::Mutex;

type Observer<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks fired in registration order. Callbacks run on the
/// notifying thread and must not call back into the set.
pub struct ObserverSet<T> {
    observers: Mutex<Vec<Observer<T>>>,
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        ObserverSet {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> ObserverSet<T> {
    pub fn add(&self, observer: impl Fn(&T) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    pub fn notify(&self, value: &T) {
        // Snapshot outside the callbacks so observers can be added while a
        // notification is in flight on another thread.
        let observers = self.observers.lock();
        for observer in observers.iter() {
            observer(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}
