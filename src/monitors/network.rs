//! Network monitor.
//!
//! Parses /proc/net/tcp and /proc/net/tcp6, dedups connections through a
//! TTL-bounded cache, and alerts on public remote addresses and suspicious
//! ports. Alerts are enriched with the owning process's cmdline and exe path
//! where the owner can still be resolved.

use crate::alert::AlertSender;
use crate::config::NetworkMonitorConfig;
use crate::state::{ConnKey, SeenConnections};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SocketEntry {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub state: String,
    pub inode: u64,
}

pub struct NetworkMonitor {
    config: NetworkMonitorConfig,
    alerts: AlertSender,
    seen: SeenConnections,
    suspicious_ports: HashSet<u16>,
    permission_warned: bool,
}

impl NetworkMonitor {
    pub fn new(config: NetworkMonitorConfig, alerts: AlertSender) -> Self {
        let suspicious_ports = config.suspicious_ports.iter().copied().collect();
        let seen = SeenConnections::new(config.cache_ttl_secs);

        Self {
            config,
            alerts,
            seen,
            suspicious_ports,
            permission_warned: false,
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Network monitor started");
        self.alerts.info("Network monitor started").await;

        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.scan_interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!("Network scan failed: {}", e);
                        self.alerts.error(format!("Network scan failed: {}", e)).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Network monitor stopped");
        Ok(())
    }

    pub async fn scan(&mut self) -> Result<()> {
        self.seen.purge_expired();

        #[cfg(target_os = "macos")]
        if !nix::unistd::Uid::effective().is_root() {
            if !self.permission_warned {
                self.alerts
                    .warning("Socket enumeration requires root, network monitoring disabled")
                    .await;
                self.permission_warned = true;
            }
            return Ok(());
        }

        let tcp_content = match fs::read_to_string("/proc/net/tcp") {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                if !self.permission_warned {
                    self.alerts
                        .error("Permission denied reading socket tables, network monitoring disabled")
                        .await;
                    self.permission_warned = true;
                }
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read /proc/net/tcp"),
        };

        for line in tcp_content.lines().skip(1) {
            if let Some(entry) = parse_tcp_line(line) {
                self.check_connection(&entry).await;
            }
        }

        if let Ok(tcp6_content) = fs::read_to_string("/proc/net/tcp6") {
            for line in tcp6_content.lines().skip(1) {
                if let Some(entry) = parse_tcp6_line(line) {
                    self.check_connection(&entry).await;
                }
            }
        }

        Ok(())
    }

    async fn check_connection(&mut self, entry: &SocketEntry) {
        // Unbound sockets carry no useful identity
        if entry.local_port == 0 {
            return;
        }

        let pid = find_pid_by_inode(entry.inode);

        let key = ConnKey {
            pid: pid.unwrap_or(0),
            local_addr: entry.local_addr.clone(),
            local_port: entry.local_port,
            remote_addr: entry.remote_addr.clone(),
            remote_port: entry.remote_port,
        };
        if !self.seen.check_and_insert(key) {
            return;
        }

        let external = is_public_ip(&entry.remote_addr);
        let bad_port = self.suspicious_ports.contains(&entry.local_port)
            || self.suspicious_ports.contains(&entry.remote_port);

        if !external && !bad_port {
            return;
        }

        let owner = describe_process(pid);

        if external {
            warn!(
                remote_addr = %entry.remote_addr,
                remote_port = entry.remote_port,
                pid = ?pid,
                "External connection"
            );
            self.alerts
                .warning(format!(
                    "External connection {}:{} -> {}:{} [{}] by {}",
                    entry.local_addr,
                    entry.local_port,
                    entry.remote_addr,
                    entry.remote_port,
                    entry.state,
                    owner
                ))
                .await;
        }

        if bad_port {
            warn!(
                local_port = entry.local_port,
                remote_port = entry.remote_port,
                pid = ?pid,
                "Suspicious port"
            );
            self.alerts
                .warning(format!(
                    "Suspicious port on connection {}:{} -> {}:{} [{}] by {}",
                    entry.local_addr,
                    entry.local_port,
                    entry.remote_addr,
                    entry.remote_port,
                    entry.state,
                    owner
                ))
                .await;
        }
    }
}

/// False for empty, unparseable, unspecified, loopback, and RFC1918
/// addresses. Everything else well-formed is public.
pub fn is_public_ip(addr: &str) -> bool {
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return false;
    };
    match ip {
        IpAddr::V4(v4) => !(v4.is_unspecified() || v4.is_loopback() || v4.is_private()),
        IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_loopback()),
    }
}

/// Owning process description for alert enrichment. Lookup failure never
/// suppresses an alert, only degrades the description.
fn describe_process(pid: Option<u32>) -> String {
    let Some(pid) = pid else {
        return "PID unknown".to_string();
    };

    let proc_path = format!("/proc/{}", pid);
    if !std::path::Path::new(&proc_path).exists() {
        return format!("PID {} (process exited)", pid);
    }

    let cmdline = match fs::read_to_string(format!("{}/cmdline", proc_path)) {
        Ok(raw) => raw.replace('\0', " ").trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return format!("PID {} (access denied)", pid);
        }
        Err(e) => return format!("PID {} (error: {})", pid, e),
    };

    let exe = fs::read_link(format!("{}/exe", proc_path))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "?".to_string());

    format!("PID {} ({}) exe={}", pid, cmdline, exe)
}

fn parse_tcp_line(line: &str) -> Option<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let local = parse_addr_port(parts[1])?;
    let remote = parse_addr_port(parts[2])?;
    let state = parse_tcp_state(parts[3]);
    let inode: u64 = parts[9].parse().ok()?;

    Some(SocketEntry {
        local_addr: local.0,
        local_port: local.1,
        remote_addr: remote.0,
        remote_port: remote.1,
        state,
        inode,
    })
}

fn parse_tcp6_line(line: &str) -> Option<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let local = parse_addr6_port(parts[1])?;
    let remote = parse_addr6_port(parts[2])?;
    let state = parse_tcp_state(parts[3]);
    let inode: u64 = parts[9].parse().ok()?;

    Some(SocketEntry {
        local_addr: local.0,
        local_port: local.1,
        remote_addr: remote.0,
        remote_port: remote.1,
        state,
        inode,
    })
}

fn parse_addr_port(s: &str) -> Option<(String, u16)> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return None;
    }

    let addr_u32 = u32::from_str_radix(parts[0], 16).ok()?;
    let addr = Ipv4Addr::from(addr_u32.swap_bytes());
    let port = u16::from_str_radix(parts[1], 16).ok()?;

    Some((addr.to_string(), port))
}

fn parse_addr6_port(s: &str) -> Option<(String, u16)> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return None;
    }

    let addr_hex = parts[0];
    if addr_hex.len() != 32 {
        return None;
    }

    let mut bytes = [0u8; 16];
    for i in 0..16 {
        bytes[i] = u8::from_str_radix(&addr_hex[i * 2..i * 2 + 2], 16).ok()?;
    }

    // /proc/net/tcp6 groups bytes in 4-byte chunks, each chunk little-endian
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.reverse();
    }

    let addr = Ipv6Addr::from(bytes);
    let port = u16::from_str_radix(parts[1], 16).ok()?;

    if let Some(ipv4) = addr.to_ipv4_mapped() {
        Some((ipv4.to_string(), port))
    } else {
        Some((addr.to_string(), port))
    }
}

fn parse_tcp_state(hex: &str) -> String {
    match hex {
        "01" => "ESTABLISHED",
        "02" => "SYN_SENT",
        "03" => "SYN_RECV",
        "04" => "FIN_WAIT1",
        "05" => "FIN_WAIT2",
        "06" => "TIME_WAIT",
        "07" => "CLOSE",
        "08" => "CLOSE_WAIT",
        "09" => "LAST_ACK",
        "0A" => "LISTEN",
        "0B" => "CLOSING",
        _ => "UNKNOWN",
    }
    .to_string()
}

fn find_pid_by_inode(inode: u64) -> Option<u32> {
    let proc_dir = fs::read_dir("/proc").ok()?;

    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();

        if let Ok(pid) = name_str.parse::<u32>() {
            let fd_path = format!("/proc/{}/fd", pid);
            if let Ok(fds) = fs::read_dir(&fd_path) {
                for fd in fds.flatten() {
                    if let Ok(link) = fs::read_link(fd.path()) {
                        if link.to_string_lossy().contains(&format!("socket:[{}]", inode)) {
                            return Some(pid);
                        }
                    }
                }
            }
        }
    }
    None
}
