//! Per-address failure counts and ban expiries.
//!
//! All state sits behind one reader/writer lock and is only reachable through
//! the operations below, so the two rules that matter hold everywhere:
//! a banned address is never counted, and an expired ban is removed together
//! with its failure count the moment anyone looks at it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::blacklist::Blacklist;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::models::{BanEntry, FailureOutcome};

#[derive(Debug, Default)]
struct BanState {
    failures: HashMap<IpAddr, u32>,
    bans: HashMap<IpAddr, DateTime<Utc>>,
}

impl BanState {
    fn forget(&mut self, ip: &IpAddr) {
        self.bans.remove(ip);
        self.failures.remove(ip);
    }
}

/// Shared attempt/ban state
pub struct BanStore {
    state: RwLock<BanState>,
    threshold: u32,
    clock: Arc<dyn Clock>,
    enforcement: Mutex<()>,
    persisting: Mutex<()>,
}

impl BanStore {
    /// Store using the system clock
    pub fn new(threshold: u32) -> Self {
        Self::with_clock(threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(BanState::default()),
            threshold,
            clock,
            enforcement: Mutex::new(()),
            persisting: Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Count one failed login from `ip`.
    ///
    /// An address that is currently banned is left untouched and never
    /// reports the threshold again. A lapsed ban is cleared first, so
    /// counting starts over.
    pub fn record_failure(&self, ip: IpAddr) -> FailureOutcome {
        let now = self.clock.now();
        let mut state = self.state.write();

        if let Some(expires_at) = state.bans.get(&ip).copied() {
            if now < expires_at {
                let count = state.failures.get(&ip).copied().unwrap_or(0);
                return FailureOutcome {
                    count,
                    reached_threshold: false,
                };
            }
            debug!(ip = %ip, "Clearing lapsed ban before counting failure");
            state.forget(&ip);
        }

        let count = state.failures.entry(ip).or_insert(0);
        *count = count.saturating_add(1);

        FailureOutcome {
            count: *count,
            reached_threshold: *count >= self.threshold,
        }
    }

    /// Whether `ip` is banned right now.
    ///
    /// An expired ban is removed along with the failure count (lazy expiry).
    /// The firewall block itself is only lifted by the sweeper.
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let now = self.clock.now();
        let state = self.state.upgradable_read();
        let expiry = state.bans.get(ip).copied();

        match expiry {
            Some(expires_at) if now < expires_at => true,
            Some(_) => {
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                state.forget(ip);
                debug!(ip = %ip, "Ban lapsed, removed on lookup");
                false
            }
            None => false,
        }
    }

    /// Exclusive right to change firewall state for stored bans.
    ///
    /// The ban path holds it from `create_ban` through `block`, the sweeper
    /// from `sweep_expired` through the last `unblock`, so an unblock for a
    /// swept ban can never land after a fresh block of the same address.
    pub async fn lock_enforcement(&self) -> MutexGuard<'_, ()> {
        self.enforcement.lock().await
    }

    /// Ban `ip` for `duration` from now and return the expiry.
    /// Expiries past the representable range saturate.
    pub fn create_ban(&self, ip: IpAddr, duration: Duration) -> DateTime<Utc> {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.state.write().bans.insert(ip, expires_at);
        expires_at
    }

    /// Addresses holding a ban record
    pub fn list_banned(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.state.read().bans.keys().copied().collect();
        ips.sort();
        ips
    }

    /// Ban records with their expiry, ordered by address
    pub fn banned_entries(&self) -> Vec<BanEntry> {
        snapshot(&self.state.read())
    }

    /// Remove every ban that has expired at `now`, together with its failure
    /// count, and return the affected addresses
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<IpAddr> {
        let mut state = self.state.write();

        let mut expired: Vec<IpAddr> = state
            .bans
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(ip, _)| *ip)
            .collect();
        expired.sort();

        for ip in &expired {
            state.forget(ip);
        }
        expired
    }

    /// Load bans recovered at startup. Returns how many were inserted.
    pub fn restore<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = BanEntry>,
    {
        let mut state = self.state.write();
        let mut restored = 0;
        for entry in entries {
            state.bans.insert(entry.ip, entry.expires_at);
            restored += 1;
        }
        restored
    }

    /// Write the ban set to `blacklist`.
    ///
    /// Persists are serialized: each one takes its snapshot and finishes its
    /// write before the next snapshot is taken, so the file never goes back
    /// to an older ban set. The file I/O runs on the blocking pool and the
    /// state lock is only held while copying the snapshot.
    pub async fn persist(&self, blacklist: &Blacklist) -> Result<()> {
        let _persisting = self.persisting.lock().await;
        let entries = self.banned_entries();
        let target = blacklist.clone();

        tokio::task::spawn_blocking(move || target.save(&entries))
            .await
            .map_err(|e| Error::Blacklist {
                path: blacklist.path().to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            })?
    }

    pub fn failure_count(&self, ip: &IpAddr) -> Option<u32> {
        self.state.read().failures.get(ip).copied()
    }

    pub fn ban_expiry(&self, ip: &IpAddr) -> Option<DateTime<Utc>> {
        self.state.read().bans.get(ip).copied()
    }

    /// Number of ban records (including lapsed ones not yet swept)
    pub fn ban_count(&self) -> usize {
        self.state.read().bans.len()
    }
}

fn snapshot(state: &BanState) -> Vec<BanEntry> {
    let mut entries: Vec<BanEntry> = state
        .bans
        .iter()
        .map(|(ip, expires_at)| BanEntry::new(*ip, *expires_at))
        .collect();
    entries.sort_by_key(|e| e.ip);
    entries
}

impl std::fmt::Debug for BanStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("BanStore")
            .field("threshold", &self.threshold)
            .field("tracked", &state.failures.len())
            .field("banned", &state.bans.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn store(threshold: u32) -> (BanStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (BanStore::with_clock(threshold, clock.clone()), clock)
    }

    #[test]
    fn test_threshold_then_rejected() {
        let (store, _) = store(3);
        let addr = ip("10.0.0.1");

        assert!(!store.record_failure(addr).reached_threshold);
        assert!(!store.record_failure(addr).reached_threshold);
        let third = store.record_failure(addr);
        assert_eq!(third.count, 3);
        assert!(third.reached_threshold);

        store.create_ban(addr, Duration::hours(1));
        assert!(store.is_banned(&addr));

        let fourth = store.record_failure(addr);
        assert_eq!(fourth.count, 3);
        assert!(!fourth.reached_threshold);
        assert_eq!(store.failure_count(&addr), Some(3));
    }

    #[test]
    fn test_counts_are_monotonic_while_unbanned() {
        let (store, _) = store(100);
        let addr = ip("10.0.0.9");
        let mut last = 0;
        for _ in 0..50 {
            let outcome = store.record_failure(addr);
            assert!(outcome.count > last);
            last = outcome.count;
        }
    }

    #[test]
    fn test_ban_expiry_boundary() {
        let (store, clock) = store(5);
        let addr = ip("10.0.0.2");
        store.record_failure(addr);
        store.create_ban(addr, Duration::hours(24));

        clock.advance(Duration::hours(23) + Duration::minutes(59));
        assert!(store.is_banned(&addr));

        clock.advance(Duration::minutes(2));
        assert!(!store.is_banned(&addr));
        assert_eq!(store.ban_expiry(&addr), None);
        assert_eq!(store.failure_count(&addr), None);
        assert!(!store.list_banned().contains(&addr));
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let (store, clock) = store(5);
        let addr = ip("10.0.0.3");
        store.create_ban(addr, Duration::minutes(10));
        clock.advance(Duration::minutes(10));
        assert!(!store.is_banned(&addr));
    }

    #[test]
    fn test_failure_after_lapse_starts_over() {
        let (store, clock) = store(2);
        let addr = ip("10.0.0.4");
        store.record_failure(addr);
        store.record_failure(addr);
        store.create_ban(addr, Duration::minutes(5));

        clock.advance(Duration::minutes(6));
        let outcome = store.record_failure(addr);
        assert_eq!(outcome.count, 1);
        assert!(store.ban_expiry(&addr).is_none());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (store, clock) = store(5);
        let short = [ip("10.0.1.1"), ip("10.0.1.2")];
        let long = [ip("10.0.2.1"), ip("10.0.2.2"), ip("10.0.2.3")];
        for addr in &short {
            store.record_failure(*addr);
            store.create_ban(*addr, Duration::minutes(30));
        }
        for addr in &long {
            store.create_ban(*addr, Duration::hours(5));
        }

        clock.advance(Duration::hours(1));
        let removed = store.sweep_expired(clock.now());
        assert_eq!(removed, short.to_vec());
        assert_eq!(store.list_banned(), long.to_vec());
        assert!(short.iter().all(|a| store.failure_count(a).is_none()));
    }

    #[test]
    fn test_create_ban_saturates_far_expiry() {
        let (store, _) = store(5);
        let addr = ip("10.0.0.5");
        let expires_at = store.create_ban(addr, Duration::days(1_000_000_000));
        assert_eq!(expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(store.is_banned(&addr));
    }

    #[tokio::test]
    async fn test_restore_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = Blacklist::new(dir.path().join("blacklist.txt"));
        let (store, clock) = store(5);

        let restored = store.restore(vec![
            BanEntry::new(ip("192.0.2.1"), clock.now() + Duration::hours(1)),
            BanEntry::new(ip("192.0.2.2"), clock.now() + Duration::hours(2)),
        ]);
        assert_eq!(restored, 2);
        assert!(store.is_banned(&ip("192.0.2.1")));

        store.persist(&blacklist).await.unwrap();
        let on_disk: Vec<IpAddr> = blacklist.load().unwrap().iter().map(|b| b.ip).collect();
        assert_eq!(on_disk, store.list_banned());
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let (store, _) = store(u32::MAX);
        let store = Arc::new(store);
        let addr = ip("10.9.9.9");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.record_failure(addr);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.failure_count(&addr), Some(2000));
    }
}
