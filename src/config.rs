use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::models::NotificationKind;

/// Longest accepted ban duration or sweep interval (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub blacklist: BlacklistConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub intel: IntelConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Locations searched by `load_or_default`, in order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/sshwarden/config.toml")];
        if let Some(dir) = dirs_next::config_dir() {
            paths.push(dir.join("sshwarden/config.toml"));
        }
        paths.push(PathBuf::from("config.toml"));
        paths
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.monitor.max_failed_attempts == 0 {
            return Err(Error::Config(
                "monitor.max_failed_attempts must be greater than 0".to_string(),
            ));
        }
        if self.monitor.auth_log.trim().is_empty() {
            return Err(Error::Config("monitor.auth_log must not be empty".to_string()));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(Error::Config(
                "monitor.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.blacklist.file.trim().is_empty() {
            return Err(Error::Config("blacklist.file must not be empty".to_string()));
        }
        if self.blacklist.ban_duration_secs == 0 {
            return Err(Error::Config(
                "blacklist.ban_duration_secs must be greater than 0".to_string(),
            ));
        }
        if self.blacklist.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "blacklist.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.blacklist.ban_duration_secs > MAX_DURATION_SECS {
            return Err(Error::Config(format!(
                "blacklist.ban_duration_secs must not exceed {}",
                MAX_DURATION_SECS
            )));
        }
        if self.blacklist.sweep_interval_secs > MAX_DURATION_SECS {
            return Err(Error::Config(format!(
                "blacklist.sweep_interval_secs must not exceed {}",
                MAX_DURATION_SECS
            )));
        }
        if self.intel.enabled && self.intel.api_url.trim().is_empty() {
            return Err(Error::Config("intel.api_url must not be empty".to_string()));
        }
        if self.notify.backend == NotifyBackend::Telegram {
            let token = self.notify.telegram.bot_token.trim();
            if token.is_empty() || token == "your_bot_token" {
                return Err(Error::Config(
                    "notify.telegram.bot_token must be set to a real token".to_string(),
                ));
            }
            if self.notify.telegram.chat_id == 0 {
                return Err(Error::Config(
                    "notify.telegram.chat_id must be set".to_string(),
                ));
            }
        }
        if self.notify.queue_size == 0 {
            return Err(Error::Config("notify.queue_size must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Path of the monitored authentication log
    pub fn auth_log_path(&self) -> PathBuf {
        PathBuf::from(&self.monitor.auth_log)
    }

    /// Path of the persisted blacklist
    pub fn blacklist_path(&self) -> PathBuf {
        PathBuf::from(&self.blacklist.file)
    }

    /// Ban duration, clamped to `MAX_DURATION_SECS` for unvalidated configs
    pub fn ban_duration(&self) -> chrono::Duration {
        let secs = self.blacklist.ban_duration_secs.min(MAX_DURATION_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.blacklist.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    /// Label used for this host in notifications
    pub fn server_label(&self) -> String {
        match &self.general.server_name {
            Some(name) => name.clone(),
            None => format!("{} ({})", self.service.service_name, self.service.install_path),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append daemon logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<String>,

    /// Host label shown in notifications (defaults to service name and path)
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// SSH authentication log to follow
    #[serde(default = "default_auth_log")]
    pub auth_log: String,

    /// Failed attempts before an address is banned
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// Wait between reads once the end of the log is reached
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reopen the log when it is truncated or replaced
    #[serde(default = "default_true")]
    pub follow_rotation: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            auth_log: default_auth_log(),
            max_failed_attempts: default_max_failed_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            follow_rotation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// File holding the active bans
    #[serde(default = "default_blacklist_file")]
    pub file: String,

    /// Ban duration in seconds
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    /// How often expired bans are lifted
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Give every persisted ban a fresh full duration at startup instead of
    /// restoring the expiry written in the file
    #[serde(default = "default_true")]
    pub renew_on_load: bool,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            file: default_blacklist_file(),
            ban_duration_secs: default_ban_duration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            renew_on_load: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Nftables,
    Ufw,
    /// Log decisions without touching the firewall
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_firewall_backend")]
    pub backend: FirewallBackend,

    #[serde(default)]
    pub nftables: NftablesConfig,

    /// Install and enable ufw when it is not active (ufw backend only)
    #[serde(default)]
    pub ufw_auto_install: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: default_firewall_backend(),
            nftables: NftablesConfig::default(),
            ufw_auto_install: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftablesConfig {
    /// Table name to use
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Chain name for input filtering
    #[serde(default = "default_chain_name")]
    pub chain_name: String,

    /// Set name for blocked IPv4 addresses
    #[serde(default = "default_set_v4")]
    pub set_v4: String,

    /// Set name for blocked IPv6 addresses
    #[serde(default = "default_set_v6")]
    pub set_v6: String,

    /// Priority for the chain (lower = earlier)
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl Default for NftablesConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            chain_name: default_chain_name(),
            set_v4: default_set_v4(),
            set_v6: default_set_v6(),
            priority: default_priority(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    /// Enrich notifications with geolocation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lookup endpoint; the address is appended as a path segment
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Language requested from the lookup service
    #[serde(default = "default_language")]
    pub language: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Extra attempts after the first failure
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Fixed wait between attempts in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_api_url(),
            language: default_language(),
            timeout_secs: default_timeout(),
            retry_count: default_retry_count(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    Telegram,
    /// Write notifications to the daemon log only
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_backend")]
    pub backend: NotifyBackend,

    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Answer /status, /test and /help bot commands
    #[serde(default)]
    pub commands_enabled: bool,

    #[serde(default = "default_true")]
    pub login_success: bool,

    #[serde(default = "default_true")]
    pub login_failed: bool,

    #[serde(default = "default_true")]
    pub ip_banned: bool,

    /// Pending notifications kept before new ones are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl NotifyConfig {
    pub fn is_enabled(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::LoginSuccess => self.login_success,
            NotificationKind::LoginFailed => self.login_failed,
            NotificationKind::IpBanned => self.ip_banned,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backend: default_notify_backend(),
            telegram: TelegramConfig::default(),
            commands_enabled: false,
            login_success: true,
            login_failed: true,
            ip_banned: true,
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,

    #[serde(default)]
    pub chat_id: i64,

    /// Bot API base URL
    #[serde(default = "default_telegram_api")]
    pub api_base: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: 0,
            api_base: default_telegram_api(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_install_path")]
    pub install_path: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Unit file name under /etc/systemd/system
    #[serde(default = "default_service_file")]
    pub service_file: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_install_path")]
    pub working_directory: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            install_path: default_install_path(),
            service_name: default_service_name(),
            service_file: default_service_file(),
            user: default_user(),
            working_directory: default_install_path(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_log() -> String {
    "/var/log/auth.log".to_string()
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_blacklist_file() -> String {
    "/var/lib/sshwarden/blacklist.txt".to_string()
}

fn default_ban_duration_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_firewall_backend() -> FirewallBackend {
    FirewallBackend::Nftables
}

fn default_table_name() -> String {
    "sshwarden".to_string()
}

fn default_chain_name() -> String {
    "input".to_string()
}

fn default_set_v4() -> String {
    "banned_v4".to_string()
}

fn default_set_v6() -> String {
    "banned_v6".to_string()
}

fn default_priority() -> i32 {
    -100 // Before most other rules
}

fn default_api_url() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_interval() -> u64 {
    1
}

fn default_notify_backend() -> NotifyBackend {
    NotifyBackend::None
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_queue_size() -> usize {
    256
}

fn default_install_path() -> String {
    "/opt/sshwarden".to_string()
}

fn default_service_name() -> String {
    "sshwarden".to_string()
}

fn default_service_file() -> String {
    "sshwarden.service".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.monitor.max_failed_attempts, 5);
        assert_eq!(config.blacklist.sweep_interval_secs, 3600);
        assert_eq!(config.firewall.nftables.table_name, "sshwarden");
        assert!(config.blacklist.renew_on_load);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.monitor.auth_log, config.monitor.auth_log);
        assert_eq!(parsed.firewall.backend, FirewallBackend::Nftables);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [monitor]
            max_failed_attempts = 3

            [firewall]
            backend = "ufw"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.monitor.max_failed_attempts, 3);
        assert_eq!(parsed.monitor.auth_log, "/var/log/auth.log");
        assert_eq!(parsed.firewall.backend, FirewallBackend::Ufw);
        assert_eq!(parsed.blacklist.ban_duration_secs, 86400);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.monitor.max_failed_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_huge_ban_duration() {
        let mut config = Config::default();
        config.blacklist.ban_duration_secs = 9_000_000_000_000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(config.ban_duration().num_seconds(), MAX_DURATION_SECS as i64);

        config.blacklist.ban_duration_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());

        config.blacklist.sweep_interval_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_telegram_credentials() {
        let mut config = Config::default();
        config.notify.backend = NotifyBackend::Telegram;
        config.notify.telegram.bot_token = "your_bot_token".to_string();
        assert!(config.validate().is_err());

        config.notify.telegram.bot_token = "123:abc".to_string();
        assert!(config.validate().is_err());

        config.notify.telegram.chat_id = 42;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[blacklist]\nban_duration_secs = 60\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.ban_duration(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_server_label() {
        let mut config = Config::default();
        assert_eq!(config.server_label(), "sshwarden (/opt/sshwarden)");
        config.general.server_name = Some("bastion-1".to_string());
        assert_eq!(config.server_label(), "bastion-1");
    }
}
