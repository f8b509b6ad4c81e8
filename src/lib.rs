pub mod blacklist;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extractor;
pub mod firewall;
pub mod intel;
pub mod models;
pub mod notify;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod tailer;
pub mod telegram;

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use blacklist::Blacklist;
use config::{Config, NotifyBackend};
use coordinator::Coordinator;
use firewall::Enforcer;
use intel::{GeoLookup, IpInfoClient};
use notify::{Dispatcher, LogNotifier, Notifier};
use store::BanStore;
use sweeper::Sweeper;
use tailer::LogTailer;
use telegram::{CommandBot, TelegramClient, TelegramNotifier};

/// The running protection service: shared state plus the tasks around it
pub struct Daemon {
    config: Config,
    store: Arc<BanStore>,
    enforcer: Arc<dyn Enforcer>,
    blacklist: Blacklist,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(BanStore::new(config.monitor.max_failed_attempts));
        let enforcer = firewall::build_enforcer(&config.firewall);
        Self::with_parts(config, store, enforcer)
    }

    /// Daemon over an existing store and enforcer
    pub fn with_parts(config: Config, store: Arc<BanStore>, enforcer: Arc<dyn Enforcer>) -> Self {
        let blacklist = Blacklist::new(config.blacklist_path());
        Self {
            config,
            store,
            enforcer,
            blacklist,
        }
    }

    pub fn store(&self) -> &Arc<BanStore> {
        &self.store
    }

    /// Load the blacklist into the store and bring the firewall in line with it.
    ///
    /// Returns the number of restored bans. An unreadable blacklist or a
    /// firewall that cannot be prepared is fatal; individual block/unblock
    /// failures are only logged.
    pub async fn restore_bans(&self) -> Result<usize> {
        let persisted = self
            .blacklist
            .load()
            .context("Failed to load blacklist")?;

        let now = self.store.now();
        let duration = self.config.ban_duration();
        let renew = self.config.blacklist.renew_on_load;

        let mut restored = Vec::new();
        let mut lapsed: Vec<IpAddr> = Vec::new();
        for entry in &persisted {
            match entry.resolve(now, duration, renew) {
                Some(ban) => restored.push(ban),
                None => lapsed.push(entry.ip),
            }
        }
        let blocked: Vec<IpAddr> = restored.iter().map(|b| b.ip).collect();
        let count = self.store.restore(restored);

        self.enforcer
            .prepare()
            .await
            .with_context(|| format!("Failed to prepare {} firewall", self.enforcer.name()))?;

        for ip in &blocked {
            if let Err(e) = self.enforcer.block(*ip).await {
                warn!(ip = %ip, action = "block", "Failed to restore block: {}", e);
            }
        }
        for ip in &lapsed {
            if let Err(e) = self.enforcer.unblock(*ip).await {
                warn!(ip = %ip, action = "unblock", "Failed to lift lapsed ban: {}", e);
            }
        }

        if !persisted.is_empty() {
            if let Err(e) = self.store.persist(&self.blacklist).await {
                error!("Failed to rewrite blacklist after restore: {}", e);
            }
        }

        info!(
            "Restored {} bans from {} ({} lapsed)",
            count,
            self.blacklist.path().display(),
            lapsed.len()
        );
        Ok(count)
    }

    fn build_notifier(&self) -> Result<(Arc<dyn Notifier>, Option<Arc<TelegramClient>>)> {
        match self.config.notify.backend {
            NotifyBackend::Telegram => {
                let client = Arc::new(
                    TelegramClient::new(self.config.notify.telegram.clone())
                        .context("Failed to create Telegram client")?,
                );
                Ok((Arc::new(TelegramNotifier::new(client.clone())), Some(client)))
            }
            NotifyBackend::None => Ok((Arc::new(LogNotifier), None)),
        }
    }

    fn build_geo(&self) -> Result<Option<Arc<dyn GeoLookup>>> {
        if !self.config.intel.enabled {
            return Ok(None);
        }
        let client = IpInfoClient::new(self.config.intel.clone())
            .context("Failed to create geolocation client")?;
        Ok(Some(Arc::new(client)))
    }

    /// Send one sample of each notification kind through the configured
    /// backend, failing on the first delivery error
    pub async fn send_test_notifications(&self) -> Result<usize> {
        let (notifier, _) = self.build_notifier()?;
        let geo = self.build_geo()?;
        let server = self.config.server_label();

        let samples = notify::samples(
            self.store.now(),
            self.store.threshold(),
            self.config.ban_duration(),
        );
        for sample in &samples {
            let location = intel::describe(geo.as_deref(), sample.ip()).await;
            let text = notify::render(sample, &location, &server);
            notifier
                .send(&text)
                .await
                .with_context(|| format!("Failed to send {} notification", sample.kind()))?;
        }
        Ok(samples.len())
    }

    /// Run until `shutdown` is cancelled or the log cannot be read any more
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.restore_bans().await?;

        let mut tailer = LogTailer::open(
            self.config.auth_log_path(),
            self.config.poll_interval(),
            self.config.monitor.follow_rotation,
            shutdown.clone(),
        )
        .await?;

        let (notifier, telegram) = self.build_notifier()?;
        let geo = self.build_geo()?;
        let (queue, rx) = notify::queue(self.config.notify.queue_size);
        let dispatcher = Dispatcher::new(
            notifier,
            geo,
            self.config.notify.clone(),
            self.config.server_label(),
        );

        let mut handles = vec![tokio::spawn(dispatcher.run(rx, shutdown.clone()))];

        let sweeper = Sweeper::new(
            self.store.clone(),
            self.enforcer.clone(),
            self.blacklist.clone(),
            self.config.sweep_interval(),
        );
        handles.push(tokio::spawn(sweeper.run(shutdown.clone())));

        if let (Some(client), true) = (telegram, self.config.notify.commands_enabled) {
            let bot = CommandBot::new(
                client,
                self.store.clone(),
                self.enforcer.clone(),
                self.config.server_label(),
                self.config.ban_duration(),
            );
            handles.push(tokio::spawn(bot.run(shutdown.clone())));
        }

        let coordinator = Coordinator::new(
            self.store.clone(),
            self.enforcer.clone(),
            self.blacklist.clone(),
            self.config.ban_duration(),
            queue,
        );

        info!(
            "Monitoring {} (threshold {}, ban {}s, firewall {})",
            tailer.path().display(),
            self.store.threshold(),
            self.config.blacklist.ban_duration_secs,
            self.enforcer.name()
        );
        let result = coordinator.run(&mut tailer, shutdown.clone()).await;
        if let Err(e) = &result {
            error!("Monitoring stopped: {}", e);
        }

        shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Daemon stopped");
        result.context("Log monitoring failed")
    }
}
