//! ICMP probe (spec.md §4.1). Shells out to the host's `ping` utility rather
//! than opening a raw socket (which would need CAP_NET_RAW) and parses its
//! textual output, the same approach as the Python reference implementation.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::common::error::ErrorKind;

#[derive(Debug, Clone, Default)]
pub struct IcmpStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss: f64,
    pub min_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct IcmpProbeResult {
    pub success: bool,
    pub duration_ms: i64,
    pub stats: IcmpStats,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// `count` is clamped to 1..=10; per-packet timeout is
/// `max(1, total_timeout / count)` (spec.md §4.1).
pub async fn run(host: &str, count: u32, total_timeout: Duration) -> IcmpProbeResult {
    let started = std::time::Instant::now();
    let count = count.clamp(1, 10);
    let per_packet_secs = (total_timeout.as_secs() / count as u64).max(1);

    let output = timeout(
        total_timeout + Duration::from_secs(2),
        Command::new("ping")
            .arg("-c")
            .arg(count.to_string())
            .arg("-W")
            .arg(per_packet_secs.to_string())
            .arg(host)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as i64;

    let output = match output {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => {
            return IcmpProbeResult {
                success: false,
                duration_ms,
                stats: IcmpStats::default(),
                error: Some(format!("failed to spawn ping: {e}")),
                error_kind: Some(ErrorKind::IcmpError),
            }
        }
        Err(_) => {
            return IcmpProbeResult {
                success: false,
                duration_ms,
                stats: IcmpStats::default(),
                error: Some("ping timed out".to_string()),
                error_kind: Some(ErrorKind::Timeout),
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{stdout}\n{stderr}");

    if let Some(reason) = classify_host_error(&combined) {
        return IcmpProbeResult {
            success: false,
            duration_ms,
            stats: IcmpStats::default(),
            error: Some(reason.to_string()),
            error_kind: Some(ErrorKind::IcmpError),
        };
    }

    let stats = parse_ping_output(&stdout, count);
    let success = stats.packets_received > 0;

    IcmpProbeResult {
        success,
        duration_ms,
        stats,
        error: if success {
            None
        } else {
            Some("no packets received".to_string())
        },
        error_kind: if success { None } else { Some(ErrorKind::IcmpError) },
    }
}

/// Maps ping's textual failure modes to the three error strings spec.md §4.1
/// calls out by name.
fn classify_host_error(output: &str) -> Option<&'static str> {
    let lower = output.to_lowercase();
    if lower.contains("unknown host") || lower.contains("name or service not known") || lower.contains("cannot resolve") {
        Some("Unknown host")
    } else if lower.contains("network is unreachable") || lower.contains("network unreachable") {
        Some("Network unreachable")
    } else if lower.contains("host is unreachable") || lower.contains("host unreachable")
        || lower.contains("destination host unreachable")
    {
        Some("Host unreachable")
    } else {
        None
    }
}

/// Parses the summary lines common to Linux iputils, macOS, and BSD ping:
///
/// ```text
/// 4 packets transmitted, 4 received, 0% packet loss, time 3004ms
/// rtt min/avg/max/mdev = 10.1/12.3/15.0/1.8 ms
/// ```
/// or the macOS/BSD phrasing:
/// ```text
/// 4 packets transmitted, 4 packets received, 0.0% packet loss
/// round-trip min/avg/max/stddev = 10.1/12.3/15.0/1.8 ms
/// ```
fn parse_ping_output(stdout: &str, requested_count: u32) -> IcmpStats {
    let mut stats = IcmpStats {
        packets_sent: requested_count,
        ..Default::default()
    };

    for line in stdout.lines() {
        let line = line.trim();
        if line.contains("packets transmitted") {
            let parts: Vec<&str> = line.split(',').collect();
            if let Some(sent) = parts.first().and_then(|p| p.split_whitespace().next()) {
                if let Ok(v) = sent.parse() {
                    stats.packets_sent = v;
                }
            }
            if let Some(received_part) = parts.get(1) {
                if let Some(v) = received_part
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    stats.packets_received = v;
                }
            }
            if let Some(loss_part) = parts.iter().find(|p| p.contains("% packet loss")) {
                if let Some(pct) = loss_part.split('%').next() {
                    if let Ok(v) = pct.trim().parse::<f64>() {
                        stats.packet_loss = v;
                    }
                }
            }
        } else if line.contains("min/avg/max") {
            if let Some(values) = line.split('=').nth(1) {
                let nums: Vec<f64> = values
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .split('/')
                    .filter_map(|s| s.parse().ok())
                    .collect();
                if nums.len() >= 3 {
                    stats.min_rtt_ms = Some(nums[0]);
                    stats.avg_rtt_ms = Some(nums[1]);
                    stats.max_rtt_ms = Some(nums[2]);
                }
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_iputils_output() {
        let stdout = "PING example.com (93.184.216.34) 56(84) bytes of data.\n\
                       64 bytes from 93.184.216.34: icmp_seq=1 ttl=55 time=11.2 ms\n\
                       \n--- example.com ping statistics ---\n\
                       4 packets transmitted, 4 received, 0% packet loss, time 3004ms\n\
                       rtt min/avg/max/mdev = 10.123/12.345/15.678/1.2 ms";
        let stats = parse_ping_output(stdout, 4);
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packet_loss, 0.0);
        assert_eq!(stats.min_rtt_ms, Some(10.123));
        assert_eq!(stats.avg_rtt_ms, Some(12.345));
        assert_eq!(stats.max_rtt_ms, Some(15.678));
    }

    #[test]
    fn parses_macos_bsd_output() {
        let stdout = "PING example.com (93.184.216.34): 56 data bytes\n\
                       64 bytes from 93.184.216.34: icmp_seq=0 ttl=55 time=11.234 ms\n\
                       \n--- example.com ping statistics ---\n\
                       4 packets transmitted, 4 packets received, 0.0% packet loss\n\
                       round-trip min/avg/max/stddev = 10.111/12.222/15.333/1.0 ms";
        let stats = parse_ping_output(stdout, 4);
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.min_rtt_ms, Some(10.111));
    }

    #[test]
    fn classifies_unknown_host() {
        assert_eq!(classify_host_error("ping: unknown host nope.invalid"), Some("Unknown host"));
    }

    #[test]
    fn classifies_network_unreachable() {
        assert_eq!(
            classify_host_error("connect: Network is unreachable"),
            Some("Network unreachable")
        );
    }

    #[test]
    fn classifies_host_unreachable() {
        assert_eq!(
            classify_host_error("From 10.0.0.1: Destination Host Unreachable"),
            Some("Host unreachable")
        );
    }

    #[test]
    fn total_packet_loss_yields_failure() {
        let stdout = "3 packets transmitted, 0 received, 100% packet loss, time 2006ms";
        let stats = parse_ping_output(stdout, 3);
        assert_eq!(stats.packets_received, 0);
    }
}
