//! Authoritative in-memory allow-list.
//!
//! Only the synchronizer touches an [`AllowList`]; nothing here is shared
//! across tasks.

use std::collections::HashMap;
use std::net::IpAddr;
use tokio::time::Instant;

use crate::error::GuardError;
use crate::netfilter::{ip_from_bytes, AddressFamily};

/// Upper bound on idle records kept for reuse.
pub const POOL_CAPACITY: usize = 1024;

/// One tracked destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowRoute {
    /// 4 bytes for IPv4, 16 for IPv6.
    pub address: Vec<u8>,
    pub expires_at: Instant,
}

impl AllowRoute {
    pub fn family(&self) -> Option<AddressFamily> {
        AddressFamily::from_len(self.address.len())
    }
}

/// Point-in-time view of one store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowEntry {
    pub address: IpAddr,
    pub expires_at: Instant,
}

/// Free-list of route records so churn does not reallocate address buffers.
#[derive(Debug, Default)]
pub struct RoutePool {
    free: Vec<AllowRoute>,
}

impl RoutePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record holding a copy of `address`, recycled when one is idle.
    pub fn acquire(&mut self, address: &[u8], expires_at: Instant) -> AllowRoute {
        match self.free.pop() {
            Some(mut route) => {
                route.address.clear();
                route.address.extend_from_slice(address);
                route.expires_at = expires_at;
                route
            }
            None => AllowRoute {
                address: address.to_vec(),
                expires_at,
            },
        }
    }

    pub fn release(&mut self, route: AllowRoute) {
        if self.free.len() < POOL_CAPACITY {
            self.free.push(route);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Result of [`AllowList::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// First sighting; the kernel set needs the address.
    New(AddressFamily),
    /// Already tracked; expiry now `max(old, new)` and the kernel is untouched.
    Extended,
}

/// Map from canonical address text to its route.
#[derive(Debug, Default)]
pub struct AllowList {
    routes: HashMap<String, AllowRoute>,
    pool: RoutePool,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AllowRoute> {
        self.routes.get(key)
    }

    /// Canonical key of a raw address, or `MalformedAddress` for a bad length.
    pub fn key_of(address: &[u8]) -> Result<String, GuardError> {
        ip_from_bytes(address)
            .map(|ip| ip.to_string())
            .ok_or(GuardError::MalformedAddress(address.len()))
    }

    /// Track `address` until `expires_at`.
    ///
    /// Expiry never moves backwards for an address already present.
    pub fn insert(&mut self, address: &[u8], expires_at: Instant) -> Result<Inserted, GuardError> {
        let key = Self::key_of(address)?;
        let family =
            AddressFamily::from_len(address.len()).ok_or(GuardError::MalformedAddress(address.len()))?;
        let incoming = self.pool.acquire(address, expires_at);

        match self.routes.get_mut(&key) {
            Some(existing) => {
                existing.expires_at = existing.expires_at.max(incoming.expires_at);
                self.pool.release(incoming);
                Ok(Inserted::Extended)
            }
            None => {
                self.routes.insert(key, incoming);
                Ok(Inserted::New(family))
            }
        }
    }

    /// Remove and return every route whose expiry is strictly before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(String, AllowRoute)> {
        let expired: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, route)| route.expires_at < now)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.routes.remove(&key).map(|route| (key, route)))
            .collect()
    }

    /// Hand a no-longer-tracked record back for reuse.
    pub fn recycle(&mut self, route: AllowRoute) {
        self.pool.release(route);
    }

    pub fn pool(&self) -> &RoutePool {
        &self.pool
    }

    /// Snapshot sorted by address.
    pub fn entries(&self) -> Vec<AllowEntry> {
        let mut entries: Vec<AllowEntry> = self
            .routes
            .values()
            .filter_map(|route| {
                ip_from_bytes(&route.address).map(|address| AllowEntry {
                    address,
                    expires_at: route.expires_at,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.address);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const V4: [u8; 4] = [192, 168, 1, 1];

    #[test]
    fn test_pool_reuses_records() {
        let mut pool = RoutePool::new();
        let now = Instant::now();
        let route = pool.acquire(&V4, now);
        pool.release(route);
        assert_eq!(pool.idle(), 1);

        let v6 = [0u8; 16];
        let route = pool.acquire(&v6, now);
        assert_eq!(route.address, v6.to_vec());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut pool = RoutePool::new();
        let now = Instant::now();
        for _ in 0..POOL_CAPACITY + 10 {
            pool.release(AllowRoute {
                address: V4.to_vec(),
                expires_at: now,
            });
        }
        assert_eq!(pool.idle(), POOL_CAPACITY);
    }

    #[test]
    fn test_insert_new_then_extend() {
        let mut store = AllowList::new();
        let now = Instant::now();

        let first = store.insert(&V4, now + Duration::from_secs(90)).unwrap();
        assert_eq!(first, Inserted::New(AddressFamily::V4));

        let second = store.insert(&V4, now + Duration::from_secs(330)).unwrap();
        assert_eq!(second, Inserted::Extended);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("192.168.1.1").unwrap().expires_at,
            now + Duration::from_secs(330)
        );
        // The duplicate's record went back to the pool
        assert_eq!(store.pool().idle(), 1);
    }

    #[test]
    fn test_expiry_never_decreases() {
        let mut store = AllowList::new();
        let now = Instant::now();
        store.insert(&V4, now + Duration::from_secs(330)).unwrap();
        store.insert(&V4, now + Duration::from_secs(90)).unwrap();
        assert_eq!(
            store.get("192.168.1.1").unwrap().expires_at,
            now + Duration::from_secs(330)
        );
    }

    #[test]
    fn test_insert_family_by_length() {
        let mut store = AllowList::new();
        let now = Instant::now();
        let mut v6 = [0u8; 16];
        v6[15] = 1;

        assert_eq!(store.insert(&v6, now).unwrap(), Inserted::New(AddressFamily::V6));
        assert!(store.get("::1").is_some());

        for len in [0usize, 3, 5, 6, 15, 17] {
            let err = store.insert(&vec![1u8; len], now).unwrap_err();
            assert_eq!(err, GuardError::MalformedAddress(len));
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_take_expired_is_strict() {
        let mut store = AllowList::new();
        let now = Instant::now();
        store.insert(&[1, 1, 1, 1], now - Duration::from_secs(1)).unwrap();
        store.insert(&[2, 2, 2, 2], now).unwrap();
        store.insert(&[3, 3, 3, 3], now + Duration::from_secs(1)).unwrap();

        let expired = store.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "1.1.1.1");
        assert_eq!(store.len(), 2);

        // Removed exactly once
        assert!(store.take_expired(now).is_empty());
    }

    #[test]
    fn test_entries_sorted() {
        let mut store = AllowList::new();
        let now = Instant::now();
        store.insert(&[9, 9, 9, 9], now).unwrap();
        store.insert(&[1, 1, 1, 1], now).unwrap();

        let entries = store.entries();
        assert_eq!(entries[0].address, "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[1].address, "9.9.9.9".parse::<IpAddr>().unwrap());
    }
}
