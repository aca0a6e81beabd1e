//! TOML-based configuration for the agent and all monitors.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_FILE_SCAN_INTERVAL_SECS: u64 = 60;
const DEFAULT_PROCESS_SCAN_INTERVAL_SECS: u64 = 3;
const DEFAULT_NETWORK_SCAN_INTERVAL_SECS: u64 = 5;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

const SUSPICIOUS_PATHS: &[&str] = &["/tmp", "/dev/shm", "/var/tmp"];

/// Parents that rarely spawn interpreters or network tools directly.
const SUSPICIOUS_PARENTS: &[&str] = &[
    "nginx", "apache2", "sshd", "systemd", "bash", "sh", "zsh",
];

const INTERPRETER_TOKENS: &[&str] = &["python", "nc"];

/// Ports commonly used by reverse shells and C2 listeners.
const SUSPICIOUS_PORTS: &[u16] = &[4444, 1337, 31337, 5555, 9001];

fn to_string_vec(arr: &[&str]) -> Vec<String> {
    arr.iter().map(|s| s.to_string()).collect()
}

fn to_pathbuf_vec(arr: &[&str]) -> Vec<PathBuf> {
    arr.iter().map(PathBuf::from).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub file_monitor: FileMonitorConfig,
    #[serde(default)]
    pub process_monitor: ProcessMonitorConfig,
    #[serde(default)]
    pub network_monitor: NetworkMonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,
    #[serde(default = "default_alert_log")]
    pub alert_log: PathBuf,
    #[serde(default = "default_alert_methods")]
    pub alert_methods: Vec<String>,
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_rules_file() -> PathBuf { PathBuf::from("/etc/secmon/rules.json") }
fn default_alert_log() -> PathBuf { PathBuf::from("/var/log/secmon/alerts.log") }
fn default_alert_methods() -> Vec<String> { vec!["log".to_string()] }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_file_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_hash_db")]
    pub hash_db: PathBuf,
}

fn default_hash_db() -> PathBuf { PathBuf::from("/var/lib/secmon/file_hashes.json") }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_process_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_suspicious_paths")]
    pub suspicious_paths: Vec<PathBuf>,
    #[serde(default = "default_suspicious_parents")]
    pub suspicious_parents: Vec<String>,
    #[serde(default = "default_interpreter_tokens")]
    pub interpreter_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_network_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_suspicious_ports")]
    pub suspicious_ports: Vec<u16>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_true() -> bool { true }
fn default_file_scan_interval() -> u64 { DEFAULT_FILE_SCAN_INTERVAL_SECS }
fn default_process_scan_interval() -> u64 { DEFAULT_PROCESS_SCAN_INTERVAL_SECS }
fn default_network_scan_interval() -> u64 { DEFAULT_NETWORK_SCAN_INTERVAL_SECS }
fn default_cache_ttl() -> u64 { DEFAULT_CACHE_TTL_SECS }
fn default_suspicious_paths() -> Vec<PathBuf> { to_pathbuf_vec(SUSPICIOUS_PATHS) }
fn default_suspicious_parents() -> Vec<String> { to_string_vec(SUSPICIOUS_PARENTS) }
fn default_interpreter_tokens() -> Vec<String> { to_string_vec(INTERPRETER_TOKENS) }
fn default_suspicious_ports() -> Vec<u16> { SUSPICIOUS_PORTS.to_vec() }

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
            rules_file: default_rules_file(),
            alert_log: default_alert_log(),
            alert_methods: default_alert_methods(),
            telegram_token: None,
            telegram_chat_id: None,
        }
    }
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: DEFAULT_FILE_SCAN_INTERVAL_SECS,
            hash_db: default_hash_db(),
        }
    }
}

impl Default for ProcessMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: DEFAULT_PROCESS_SCAN_INTERVAL_SECS,
            suspicious_paths: default_suspicious_paths(),
            suspicious_parents: default_suspicious_parents(),
            interpreter_tokens: default_interpreter_tokens(),
        }
    }
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: DEFAULT_NETWORK_SCAN_INTERVAL_SECS,
            suspicious_ports: default_suspicious_ports(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn load_or_default(path: &std::path::Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Load with defaults on failure. A missing file is normal and silent;
    /// a file that exists but cannot be read or parsed yields defaults plus
    /// the failure for the caller to report.
    pub fn load_with_fallback(path: &std::path::Path) -> (Self, Option<String>) {
        if !path.exists() {
            return (Self::default(), None);
        }
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (
                Self::default(),
                Some(format!("Failed to load config {}: {:#}", path.display(), e)),
            ),
        }
    }

    /// Telegram credentials with environment overrides applied.
    /// `TELEGRAM_TOKEN` and `TELEGRAM_CHAT_ID` take precedence over the file.
    pub fn telegram_credentials(&self) -> (Option<String>, Option<String>) {
        let token = std::env::var("TELEGRAM_TOKEN")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.general.telegram_token.clone());
        let chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.general.telegram_chat_id.clone());
        (token, chat_id)
    }

    /// Startup validation. Must pass before any monitor is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.general.alert_methods.iter().any(|m| m == "telegram") {
            let (token, chat_id) = self.telegram_credentials();
            if token.is_none() || chat_id.is_none() {
                bail!("telegram alerting enabled but telegram_token/telegram_chat_id not set");
            }
        }
        for method in &self.general.alert_methods {
            if method != "log" && method != "telegram" {
                bail!("unknown alert method '{}'", method);
            }
        }
        if self.file_monitor.enabled && self.file_monitor.scan_interval_secs == 0 {
            bail!("file_monitor.scan_interval_secs must be greater than zero");
        }
        if self.process_monitor.enabled && self.process_monitor.scan_interval_secs == 0 {
            bail!("process_monitor.scan_interval_secs must be greater than zero");
        }
        if self.network_monitor.enabled && self.network_monitor.scan_interval_secs == 0 {
            bail!("network_monitor.scan_interval_secs must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.file_monitor.scan_interval_secs, 60);
        assert_eq!(config.process_monitor.scan_interval_secs, 3);
        assert_eq!(config.network_monitor.scan_interval_secs, 5);
        assert_eq!(config.network_monitor.cache_ttl_secs, 3600);
        assert!(config.network_monitor.suspicious_ports.contains(&4444));
        assert!(config.network_monitor.suspicious_ports.contains(&31337));
        assert_eq!(config.general.alert_methods, vec!["log".to_string()]);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
            [network_monitor]
            scan_interval_secs = 10
            suspicious_ports = [8080]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.network_monitor.scan_interval_secs, 10);
        assert_eq!(config.network_monitor.suspicious_ports, vec![8080]);
        // Untouched sections keep their defaults
        assert_eq!(config.process_monitor.scan_interval_secs, 3);
        assert!(config.process_monitor.suspicious_parents.contains(&"sshd".to_string()));
    }

    #[test]
    fn test_validate_telegram_without_credentials() {
        let mut config = Config::default();
        config.general.alert_methods = vec!["log".to_string(), "telegram".to_string()];
        // Credentials neither in config nor environment
        std::env::remove_var("TELEGRAM_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        assert!(config.validate().is_err());

        config.general.telegram_token = Some("123:abc".to_string());
        config.general.telegram_chat_id = Some("42".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Config::default();
        config.process_monitor.scan_interval_secs = 0;
        assert!(config.validate().is_err());

        config.process_monitor.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_with_fallback_missing_file_silent() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, error) = Config::load_with_fallback(&dir.path().join("absent.toml"));
        assert!(error.is_none());
        assert_eq!(config.process_monitor.scan_interval_secs, 3);
    }

    #[test]
    fn test_load_with_fallback_malformed_file_reports() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general\nlog_level = ").unwrap();

        let (config, error) = Config::load_with_fallback(&path);
        assert_eq!(config.file_monitor.scan_interval_secs, 60);
        let message = error.unwrap();
        assert!(message.contains("config.toml"));
    }

    #[test]
    fn test_load_with_fallback_valid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network_monitor]\nscan_interval_secs = 30\n").unwrap();

        let (config, error) = Config::load_with_fallback(&path);
        assert!(error.is_none());
        assert_eq!(config.network_monitor.scan_interval_secs, 30);
    }

    #[test]
    fn test_validate_unknown_method() {
        let mut config = Config::default();
        config.general.alert_methods = vec!["syslog".to_string()];
        assert!(config.validate().is_err());
    }
}
