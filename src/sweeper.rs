use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blacklist::Blacklist;
use crate::firewall::Enforcer;
use crate::models::SweepReport;
use crate::store::BanStore;

/// Periodically lifts expired bans
pub struct Sweeper {
    store: Arc<BanStore>,
    enforcer: Arc<dyn Enforcer>,
    blacklist: Blacklist,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<BanStore>,
        enforcer: Arc<dyn Enforcer>,
        blacklist: Blacklist,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            enforcer,
            blacklist,
            interval,
        }
    }

    /// Remove every expired ban, unblock it, and rewrite the blacklist.
    ///
    /// Unblock failures are logged and do not stop the sweep; the address is
    /// gone from the store either way.
    ///
    /// Runs under the store's enforcement lock, so a ban created for a swept
    /// address waits until its stale unblock has completed.
    pub async fn sweep_once(&self) -> SweepReport {
        let _enforcing = self.store.lock_enforcement().await;
        let removed = self.store.sweep_expired(self.store.now());
        if removed.is_empty() {
            debug!("Sweep found no expired bans");
            return SweepReport::default();
        }

        let mut unblock_failures = Vec::new();
        for ip in &removed {
            match self.enforcer.unblock(*ip).await {
                Ok(()) => info!(ip = %ip, "Ban expired, address unblocked"),
                Err(e) => {
                    warn!(ip = %ip, action = "unblock", "Failed to unblock expired ban: {}", e);
                    unblock_failures.push(*ip);
                }
            }
        }

        if let Err(e) = self.store.persist(&self.blacklist).await {
            error!("Failed to rewrite blacklist after sweep: {}", e);
        }

        info!(
            "Sweep removed {} expired bans ({} unblock failures)",
            removed.len(),
            unblock_failures.len()
        );
        SweepReport {
            removed,
            unblock_failures,
        }
    }

    /// Sweep every `interval` until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already handled the file
        ticker.tick().await;

        info!("Sweeper running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        info!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::firewall::RecordingFirewall;
    use chrono::Duration as ChronoDuration;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: Arc<BanStore>,
        firewall: Arc<RecordingFirewall>,
        sweeper: Sweeper,
        blacklist: Blacklist,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(BanStore::with_clock(5, clock.clone()));
        let firewall = Arc::new(RecordingFirewall::new());
        let blacklist = Blacklist::new(dir.path().join("blacklist.txt"));
        let sweeper = Sweeper::new(
            store.clone(),
            firewall.clone(),
            blacklist.clone(),
            Duration::from_secs(3600),
        );
        Fixture {
            _dir: dir,
            clock,
            store,
            firewall,
            sweeper,
            blacklist,
        }
    }

    #[tokio::test]
    async fn test_sweep_two_of_five_with_one_failure() {
        let f = fixture();
        let expiring = [ip("10.0.0.1"), ip("10.0.0.2")];
        let lasting = [ip("10.0.1.1"), ip("10.0.1.2"), ip("10.0.1.3")];
        for addr in &expiring {
            f.store.create_ban(*addr, ChronoDuration::minutes(10));
        }
        for addr in &lasting {
            f.store.create_ban(*addr, ChronoDuration::hours(10));
        }
        f.firewall.fail_for(expiring[0]);

        f.clock.advance(ChronoDuration::hours(1));
        let report = f.sweeper.sweep_once().await;

        assert_eq!(report.removed, expiring.to_vec());
        assert_eq!(report.unblock_failures, vec![expiring[0]]);
        assert_eq!(f.firewall.count("unblock"), 2);
        assert_eq!(f.store.list_banned(), lasting.to_vec());

        let on_disk: Vec<IpAddr> = f.blacklist.load().unwrap().iter().map(|b| b.ip).collect();
        assert_eq!(on_disk, lasting.to_vec());
    }

    #[tokio::test]
    async fn test_empty_sweep_leaves_file_alone() {
        let f = fixture();
        f.store.create_ban(ip("10.0.0.1"), ChronoDuration::hours(1));

        let report = f.sweeper.sweep_once().await;
        assert!(report.is_empty());
        assert_eq!(f.firewall.count("unblock"), 0);
        assert!(!f.blacklist.path().exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.sweeper.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
