//! Alert types and delivery - log file and optional Telegram.

use crate::config::{Config, LogFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
}

/// Cloneable handle monitors use to emit alerts.
///
/// Sending never fails observably: a closed channel during shutdown is not an
/// error any monitor can act on.
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

impl AlertSender {
    pub fn new(tx: mpsc::Sender<Alert>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, severity: Severity, message: impl Into<String>) {
        let alert = Alert {
            message: message.into(),
            severity,
        };
        let _ = self.tx.send(alert).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.send(Severity::Info, message).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.send(Severity::Warning, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(Severity::Error, message).await;
    }
}

#[derive(Debug, Clone)]
struct TelegramTarget {
    token: String,
    chat_id: String,
}

/// Dispatcher task. Drains the alert channel and delivers each alert to the
/// configured sinks. Delivery failures are logged and swallowed so one broken
/// sink never stalls the monitors.
pub struct Alerter {
    log_format: LogFormat,
    alert_log: PathBuf,
    log_enabled: bool,
    telegram: Option<TelegramTarget>,
    http_client: reqwest::Client,
}

impl Alerter {
    pub fn new(config: &Config) -> Self {
        let log_enabled = config.general.alert_methods.iter().any(|m| m == "log");

        let telegram = if config.general.alert_methods.iter().any(|m| m == "telegram") {
            let (token, chat_id) = config.telegram_credentials();
            match (token, chat_id) {
                (Some(token), Some(chat_id)) => Some(TelegramTarget { token, chat_id }),
                _ => None, // validate() rejects this before we get here
            }
        } else {
            None
        };

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            log_format: config.general.log_format,
            alert_log: config.general.alert_log.clone(),
            log_enabled,
            telegram,
            http_client,
        }
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<Alert>) {
        info!("Alert dispatcher started");
        while let Some(alert) = rx.recv().await {
            self.handle_alert(&alert).await;
        }
        info!("Alert dispatcher stopped");
    }

    async fn handle_alert(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => info!("{}", alert.message),
            Severity::Warning => warn!("{}", alert.message),
            Severity::Error => error!("{}", alert.message),
        }

        if self.log_enabled {
            if let Err(e) = self.append_log(alert) {
                error!("Failed to write alert log: {}", e);
            }
        }

        if let Some(ref target) = self.telegram {
            self.send_telegram(target, alert).await;
        }
    }

    fn append_log(&self, alert: &Alert) -> Result<()> {
        if let Some(parent) = self.alert_log.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.alert_log)
            .with_context(|| format!("Failed to open {}", self.alert_log.display()))?;

        let line = match self.log_format {
            LogFormat::Text => format!(
                "[{}] {}: {}\n",
                chrono::Utc::now().to_rfc3339(),
                alert.severity.label(),
                alert.message
            ),
            LogFormat::Json => {
                let payload = serde_json::json!({
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "severity": alert.severity,
                    "message": alert.message,
                });
                format!("{}\n", payload)
            }
        };

        file.write_all(line.as_bytes())
            .context("Failed to append alert")?;
        Ok(())
    }

    async fn send_telegram(&self, target: &TelegramTarget, alert: &Alert) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", target.token);
        let payload = serde_json::json!({
            "chat_id": target.chat_id,
            "text": format!("[{}] {}", alert.severity.label(), alert.message),
        });

        match self.http_client.post(&url).json(&payload).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    warn!("Telegram API returned status {}", resp.status());
                }
            }
            Err(e) => {
                error!("Telegram delivery failed: {}", e);
            }
        }
    }
}
