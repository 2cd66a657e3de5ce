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

//! Outbound bandwidth limiting.

use std::time::Instant;

use parking_lot::Mutex;

struct TokenBucket {
    capacity: usize,
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(fill_rate: f64, capacity: usize) -> Self {
        TokenBucket {
            capacity,
            tokens: capacity as f64,
            fill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens: usize) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity as f64);
        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }
}

/// Token bucket over outbound bytes; limit 0 means unbounded.
pub struct BandwidthLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl BandwidthLimiter {
    /// `limit` is bytes per second sustained; `burst_ratio` scales the burst
    /// capacity above it.
    pub fn new(burst_ratio: f64, limit: usize) -> Self {
        BandwidthLimiter {
            bucket: if limit == 0 {
                None
            } else {
                Some(Mutex::new(TokenBucket::new(
                    limit as f64,
                    (limit as f64 * burst_ratio) as usize,
                )))
            },
        }
    }

    /// Whether an outbound buffer of `size` bytes should be dropped.
    pub fn should_drop(&self, size: usize) -> bool {
        match &self.bucket {
            Some(bucket) => !bucket.lock().try_consume(size),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_drops() {
        let limiter = BandwidthLimiter::new(1.0, 0);
        assert!(!limiter.should_drop(usize::MAX / 2));
    }

    #[test]
    fn burst_capacity_is_enforced() {
        let limiter = BandwidthLimiter::new(2.0, 1000);
        // Burst allows 2000 bytes up front.
        assert!(!limiter.should_drop(1500));
        assert!(!limiter.should_drop(500));
        assert!(limiter.should_drop(1000));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = BandwidthLimiter::new(1.0, 100_000);
        assert!(!limiter.should_drop(100_000));
        assert!(limiter.should_drop(50_000));
        std::thread::sleep(std::time::Duration::from_millis(600));
        assert!(!limiter.should_drop(50_000));
    }
}
