//! Telegram Bot API: message delivery and the command poller.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::firewall::Enforcer;
use crate::notify::{self, Notifier};
use crate::store::BanStore;

/// Seconds Telegram holds a `getUpdates` request open
const POLL_TIMEOUT_SECS: u64 = 30;
/// Pause after a failed poll
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Minimal Bot API client
#[derive(Debug)]
pub struct TelegramClient {
    config: TelegramConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn chat_id(&self) -> i64 {
        self.config.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call<B, T>(&self, method: &str, body: &B, timeout: Option<Duration>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self.client.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        // reqwest errors include the URL, which carries the bot token
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Notification(format!("{}: {}", method, e.without_url())))?;
        let status = resp.status();
        let body: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| Error::Notification(format!("{}: {}", method, e.without_url())))?;

        if !body.ok {
            return Err(Error::Notification(format!(
                "{} returned {}: {}",
                method,
                status,
                body.description.unwrap_or_default()
            )));
        }
        body.result
            .ok_or_else(|| Error::Notification(format!("{}: empty result", method)))
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call("sendMessage", &SendMessage { chat_id, text }, None)
            .await?;
        Ok(())
    }

    /// Long-poll for updates newer than `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let body = GetUpdates {
            offset,
            timeout: POLL_TIMEOUT_SECS,
            allowed_updates: ["message"],
        };
        let timeout = Duration::from_secs(POLL_TIMEOUT_SECS + self.config.timeout_secs);
        self.call("getUpdates", &body, Some(timeout)).await
    }
}

/// Sends notifications to the configured chat
pub struct TelegramNotifier {
    client: Arc<TelegramClient>,
}

impl TelegramNotifier {
    pub fn new(client: Arc<TelegramClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.client.send_message(self.client.chat_id(), text).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    Test,
    Unknown(String),
}

impl BotCommand {
    /// Parse a message text; anything not starting with `/` is not a command
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        // Group chats address commands as /status@botname
        let name = name.split('@').next().unwrap_or(name);

        Some(match name {
            "start" => BotCommand::Start,
            "help" => BotCommand::Help,
            "status" => BotCommand::Status,
            "test" => BotCommand::Test,
            other => BotCommand::Unknown(other.to_string()),
        })
    }
}

/// Answers bot commands sent to the configured chat
pub struct CommandBot {
    client: Arc<TelegramClient>,
    store: Arc<BanStore>,
    enforcer: Arc<dyn Enforcer>,
    server: String,
    ban_duration: chrono::Duration,
}

impl CommandBot {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<BanStore>,
        enforcer: Arc<dyn Enforcer>,
        server: String,
        ban_duration: chrono::Duration,
    ) -> Self {
        Self {
            client,
            store,
            enforcer,
            server,
            ban_duration,
        }
    }

    /// Reply text for `command`
    pub async fn reply(&self, command: &BotCommand) -> String {
        match command {
            BotCommand::Start => "Welcome to sshwarden!\nAvailable commands:\n\
                 /status - show daemon status\n\
                 /test - send test notifications\n\
                 /help - show this help"
                .to_string(),
            BotCommand::Help => "sshwarden commands:\n\
                 /start - get started\n\
                 /status - show daemon status\n\
                 /test - send test notifications\n\
                 /help - show this help"
                .to_string(),
            BotCommand::Status => self.status().await,
            BotCommand::Test => match self.send_samples().await {
                Ok(()) => "Test notifications sent, check that they arrived".to_string(),
                Err(e) => format!("Test failed: {}", e),
            },
            BotCommand::Unknown(_) => "Unknown command, use /help to list commands".to_string(),
        }
    }

    async fn status(&self) -> String {
        let now = self.store.now();
        let active = self
            .store
            .banned_entries()
            .iter()
            .filter(|e| !e.is_expired_at(now))
            .count();
        let firewall = if self.enforcer.is_active().await {
            "active"
        } else {
            "inactive"
        };

        format!(
            "sshwarden status:\n- running\n- active bans: {}\n- failure threshold: {}\n- firewall: {} ({})\n- server: {}",
            active,
            self.store.threshold(),
            self.enforcer.name(),
            firewall,
            self.server
        )
    }

    async fn send_samples(&self) -> Result<()> {
        let samples = notify::samples(self.store.now(), self.store.threshold(), self.ban_duration);
        for sample in &samples {
            let location = format!("IP: {}", sample.ip());
            let text = notify::render(sample, &location, &self.server);
            self.client.send_message(self.client.chat_id(), &text).await?;
        }
        Ok(())
    }

    async fn handle(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(command) = message.text.as_deref().and_then(BotCommand::parse) else {
            return;
        };
        if message.chat.id != self.client.chat_id() {
            debug!(chat = message.chat.id, "Ignoring command from foreign chat");
            return;
        }

        debug!("Bot command {:?}", command);
        let text = self.reply(&command).await;
        if let Err(e) = self.client.send_message(message.chat.id, &text).await {
            warn!("Failed to answer bot command: {}", e);
        }
    }

    /// Poll for commands until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Telegram command poller started");
        let mut offset = 0;

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.client.get_updates(offset) => polled,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle(update).await;
                    }
                }
                Err(e) => {
                    warn!("Telegram poll failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        info!("Telegram command poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::RecordingFirewall;

    fn bot() -> CommandBot {
        let client = Arc::new(
            TelegramClient::new(TelegramConfig {
                bot_token: "123:abc".to_string(),
                chat_id: 42,
                ..TelegramConfig::default()
            })
            .unwrap(),
        );
        CommandBot::new(
            client,
            Arc::new(BanStore::new(5)),
            Arc::new(RecordingFirewall::new()),
            "bastion".to_string(),
            chrono::Duration::hours(24),
        )
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(BotCommand::parse("/status"), Some(BotCommand::Status));
        assert_eq!(BotCommand::parse(" /help extra"), Some(BotCommand::Help));
        assert_eq!(BotCommand::parse("/test@warden_bot"), Some(BotCommand::Test));
        assert_eq!(
            BotCommand::parse("/reboot"),
            Some(BotCommand::Unknown("reboot".to_string()))
        );
        assert_eq!(BotCommand::parse("hello"), None);
        assert_eq!(BotCommand::parse(""), None);
    }

    #[test]
    fn test_method_url() {
        let client = TelegramClient::new(TelegramConfig {
            bot_token: "123:abc".to_string(),
            api_base: "https://api.telegram.org/".to_string(),
            ..TelegramConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_update_parsing() {
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(
            r#"{"ok":true,"result":[{"update_id":7,"message":{"message_id":1,"chat":{"id":42,"type":"private"},"text":"/status"}}]}"#,
        )
        .unwrap();
        let updates = body.result.unwrap();
        assert_eq!(updates[0].update_id, 7);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 42);
    }

    #[tokio::test]
    async fn test_status_reply() {
        let bot = bot();
        bot.store
            .create_ban("10.0.0.1".parse().unwrap(), chrono::Duration::hours(1));

        let text = bot.reply(&BotCommand::Status).await;
        assert!(text.contains("active bans: 1"));
        assert!(text.contains("failure threshold: 5"));
        assert!(text.contains("firewall: recording (active)"));
    }

    #[tokio::test]
    async fn test_unknown_command_reply() {
        let text = bot().reply(&BotCommand::Unknown("x".to_string())).await;
        assert!(text.contains("/help"));
    }
}
