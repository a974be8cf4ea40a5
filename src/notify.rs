use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::config::EnvSource;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects longer messages.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Delivers the end-of-run summary. One call per run.
pub trait Notifier: Send + Sync {
    fn send(&self, text: &str) -> Result<()>;
}

/// Used when no channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API `sendMessage` over a blocking client.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: reqwest::blocking::Client,
    token: String,
    chat_id: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build HTTP client")?;
        Ok(TelegramNotifier {
            http,
            token: token.into(),
            chat_id: chat_id.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base.trim_end_matches('/'), self.token, method)
    }
}

impl Notifier for TelegramNotifier {
    fn send(&self, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_message(text),
        });
        // the token is part of the URL; keep it out of error messages
        let resp = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .map_err(|e| anyhow::anyhow!("sendMessage request failed: {}", e.without_url()))?;
        let status = resp.status();
        let api: ApiResponse = resp.json().with_context(|| format!("parse sendMessage response ({})", status))?;
        if !api.ok {
            bail!(
                "Telegram API error {}: {}",
                status.as_u16(),
                api.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(())
    }
}

/// Keeps every message sent; for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(text.to_string());
        Ok(())
    }
}

/// `TELEGRAM_BOT_TOKEN` + `TELEGRAM_CHAT_ID`, or a `NullNotifier` when either is missing.
pub fn notifier_from_env(env: &dyn EnvSource) -> Box<dyn Notifier> {
    match (env.var("TELEGRAM_BOT_TOKEN"), env.var("TELEGRAM_CHAT_ID")) {
        (Some(token), Some(chat)) => match TelegramNotifier::new(token, chat) {
            Ok(n) => Box::new(n),
            Err(e) => {
                tracing::warn!("[notify] Telegram disabled: {:#}", e);
                Box::new(NullNotifier)
            }
        },
        _ => {
            tracing::warn!("[notify] TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID not set, notifications disabled");
            Box::new(NullNotifier)
        }
    }
}

/// Send and log; delivery problems never fail the run.
pub fn deliver(notifier: &dyn Notifier, text: &str) -> bool {
    match notifier.send(text) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("[notify] delivery failed: {:#}", e);
            false
        }
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    out.push('…');
    out
}
