//! Outbound alert channel.
//!
//! Telegram-compatible bot API. Alert failures are logged and swallowed;
//! nothing in the pipeline depends on delivery.

use std::time::Duration;

use engram_config::AlertConfig;
use serde_json::json;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AlertChannel {
    config: AlertConfig,
    http: reqwest::Client,
}

impl AlertChannel {
    pub fn new(config: AlertConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("http client");
        Self { config, http }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    /// Send a titled alert. Returns whether delivery succeeded.
    pub async fn send(&self, title: &str, body: &str, level: &str) -> bool {
        let (Some(token), Some(chat_id)) = (&self.config.bot_token, &self.config.chat_id) else {
            return false;
        };
        let emoji = match level {
            "warning" => "\u{26a0}\u{fe0f}",
            "error" => "\u{274c}",
            "critical" => "\u{1f525}",
            _ => "\u{2139}\u{fe0f}",
        };
        let message = format!("{emoji} *Engram: {title}*\n\n{body}");
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let result = self
            .http
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "Markdown",
            }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!("alerts: send failed with HTTP {}", response.status());
                false
            }
            Err(e) => {
                error!("alerts: send failed: {e}");
                false
            }
        }
    }

    /// Fire-and-forget variant used from the pipeline.
    pub async fn send_best_effort(&self, title: &str, body: &str, level: &str) {
        if !self.enabled() {
            return;
        }
        if !self.send(title, body, level).await {
            warn!("alerts: dropped alert '{title}'");
        }
    }
}

/// Mask a credential-like value for safe logging: first four and last
/// four characters, or `***` when too short to mask meaningfully.
pub fn mask_value(value: &str) -> String {
    if value.len() <= 8 {
        return "***".to_string();
    }
    let head: String = value.chars().take(4).collect();
    let tail: String = value.chars().skip(value.chars().count() - 4).collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_preserves_only_edges() {
        assert_eq!(
            mask_value("sk-abcdef0123456789abcdef0123456789"),
            "sk-a...6789"
        );
        assert_eq!(mask_value("short"), "***");
        assert_eq!(mask_value("12345678"), "***");
    }

    #[tokio::test]
    async fn disabled_channel_never_sends() {
        let channel = AlertChannel::new(AlertConfig {
            bot_token: None,
            chat_id: None,
        });
        assert!(!channel.enabled());
        assert!(!channel.send("t", "b", "info").await);
    }
}
