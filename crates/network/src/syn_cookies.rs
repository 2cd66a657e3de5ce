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

//! Node-id handshake cookies.
//!
//! A connecting peer is challenged with a random cookie and must return it
//! signed by its node-id key, preventing a man in the middle from claiming
//! someone else's identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use ethereum_types::H256;
use parking_lot::Mutex;
use rand::RngCore;

use lattice_types::{validate_message, Account, Signature};

struct CookieInfo {
    cookie: H256,
    created_at: Instant,
}

pub struct SynCookies {
    cookies: Mutex<HashMap<SocketAddr, CookieInfo>>,
    cookies_per_ip: Mutex<HashMap<std::net::IpAddr, usize>>,
    max_cookies_per_ip: usize,
}

impl SynCookies {
    pub fn new(max_cookies_per_ip: usize) -> Self {
        SynCookies {
            cookies: Mutex::new(HashMap::new()),
            cookies_per_ip: Mutex::new(HashMap::new()),
            max_cookies_per_ip,
        }
    }

    /// Issue a cookie for `endpoint`. `None` when the IP is rate capped or
    /// the endpoint already holds an outstanding query.
    pub fn assign(&self, endpoint: SocketAddr) -> Option<H256> {
        let ip = endpoint.ip();
        {
            let mut per_ip = self.cookies_per_ip.lock();
            let count = per_ip.entry(ip).or_insert(0);
            if *count >= self.max_cookies_per_ip {
                return None;
            }
            *count += 1;
        }
        let mut cookies = self.cookies.lock();
        if cookies.contains_key(&endpoint) {
            let mut per_ip = self.cookies_per_ip.lock();
            if let Some(count) = per_ip.get_mut(&ip) {
                *count -= 1;
            }
            return None;
        }
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let cookie = H256(bytes);
        cookies.insert(
            endpoint,
            CookieInfo {
                cookie,
                created_at: Instant::now(),
            },
        );
        Some(cookie)
    }

    /// Check a handshake response; a valid one consumes the cookie.
    pub fn validate(&self, endpoint: SocketAddr, node_id: &Account, signature: &Signature) -> bool {
        let mut cookies = self.cookies.lock();
        let valid = match cookies.get(&endpoint) {
            Some(info) => validate_message(node_id, info.cookie.as_bytes(), signature),
            None => false,
        };
        if valid {
            cookies.remove(&endpoint);
            let mut per_ip = self.cookies_per_ip.lock();
            if let Some(count) = per_ip.get_mut(&endpoint.ip()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_ip.remove(&endpoint.ip());
                }
            }
        }
        valid
    }

    /// Drop cookies issued before `cutoff`.
    pub fn purge(&self, cutoff: Instant) {
        let mut cookies = self.cookies.lock();
        let mut per_ip = self.cookies_per_ip.lock();
        cookies.retain(|endpoint, info| {
            let keep = info.created_at >= cutoff;
            if !keep {
                if let Some(count) = per_ip.get_mut(&endpoint.ip()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        per_ip.remove(&endpoint.ip());
                    }
                }
            }
            keep
        });
    }

    pub fn size(&self) -> usize {
        self.cookies.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{sign_message, KeyPair};

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn assign_validate_consume() {
        let cookies = SynCookies::new(10);
        let key = KeyPair::generate();
        let cookie = cookies.assign(endpoint(1000)).unwrap();
        let signature = sign_message(key.secret_key(), &key.public_key(), cookie.as_bytes());
        assert!(cookies.validate(endpoint(1000), &key.public_key(), &signature));
        // Consumed; a replay fails.
        assert!(!cookies.validate(endpoint(1000), &key.public_key(), &signature));
    }

    #[test]
    fn bad_signature_keeps_the_cookie() {
        let cookies = SynCookies::new(10);
        let key = KeyPair::generate();
        let cookie = cookies.assign(endpoint(1001)).unwrap();
        let signature = sign_message(key.secret_key(), &key.public_key(), b"not the cookie");
        assert!(!cookies.validate(endpoint(1001), &key.public_key(), &signature));
        let good = sign_message(key.secret_key(), &key.public_key(), cookie.as_bytes());
        assert!(cookies.validate(endpoint(1001), &key.public_key(), &good));
    }

    #[test]
    fn per_ip_cap() {
        let cookies = SynCookies::new(2);
        assert!(cookies.assign(endpoint(1)).is_some());
        assert!(cookies.assign(endpoint(2)).is_some());
        assert!(cookies.assign(endpoint(3)).is_none());
    }

    #[test]
    fn duplicate_endpoint_is_refused() {
        let cookies = SynCookies::new(10);
        assert!(cookies.assign(endpoint(5)).is_some());
        assert!(cookies.assign(endpoint(5)).is_none());
        assert_eq!(cookies.size(), 1);
    }

    #[test]
    fn purge_drops_stale_cookies() {
        let cookies = SynCookies::new(10);
        cookies.assign(endpoint(7)).unwrap();
        cookies.purge(Instant::now() + std::time::Duration::from_secs(1));
        assert_eq!(cookies.size(), 0);
        // The IP slot is released too.
        assert!(cookies.assign(endpoint(7)).is_some());
    }
}
