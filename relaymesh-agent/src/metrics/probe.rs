//! Latency probes using the system `ping` command.

use futures::future::join_all;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// What one `ping` run told us
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProbeOutcome {
    /// Average round trip, None when no reply came back
    pub rtt_ms: Option<f64>,
    /// Loss ratio in [0, 1], None when no summary was printed
    pub loss: Option<f64>,
}

/// Aggregated over all reference targets
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LatencyReport {
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
}

/// Probes every target concurrently.
pub async fn measure(targets: &[String], count: u32, timeout: Duration) -> LatencyReport {
    let outcomes = join_all(targets.iter().map(|t| ping(t, count, timeout))).await;
    for (target, outcome) in targets.iter().zip(&outcomes) {
        match outcome.rtt_ms {
            Some(rtt) => debug!(host = %target, rtt_ms = rtt, "ping ok"),
            None => warn!(host = %target, loss = ?outcome.loss, "ping failed"),
        }
    }
    aggregate(&outcomes)
}

/// Mean of successful round trips and of parsed loss ratios.
pub fn aggregate(outcomes: &[ProbeOutcome]) -> LatencyReport {
    LatencyReport {
        latency_ms: mean(outcomes.iter().filter_map(|o| o.rtt_ms)).map(|v| (v * 100.0).round() / 100.0),
        packet_loss: mean(outcomes.iter().filter_map(|o| o.loss)),
    }
}

async fn ping(target: &str, count: u32, timeout: Duration) -> ProbeOutcome {
    let count_arg = count.to_string();
    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        let wait_ms = timeout.as_millis().to_string();
        cmd.args(["-n", count_arg.as_str(), "-w", wait_ms.as_str(), target]);
    } else {
        let wait_secs = timeout.as_secs().max(1).to_string();
        cmd.args(["-c", count_arg.as_str(), "-W", wait_secs.as_str(), target]);
    }
    cmd.kill_on_drop(true);

    // ping enforces its own per-reply timeout; this bounds the whole process
    let limit = timeout * count.max(1) + Duration::from_secs(1);
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => parse_ping_output(&String::from_utf8_lossy(&output.stdout)),
        Ok(Err(e)) => {
            warn!(host = target, error = %e, "failed to run ping");
            ProbeOutcome::default()
        }
        Err(_) => {
            warn!(host = target, "ping timed out");
            ProbeOutcome::default()
        }
    }
}

/// Parses Linux, macOS and Windows `ping` summaries.
pub fn parse_ping_output(output: &str) -> ProbeOutcome {
    let mut outcome = ProbeOutcome::default();

    for line in output.lines() {
        let lower = line.to_ascii_lowercase();

        if lower.contains("loss") {
            outcome.loss = lower
                .split_whitespace()
                .find(|tok| tok.contains('%'))
                .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.'))
                .and_then(|n| n.parse::<f64>().ok())
                .map(|pct| (pct / 100.0).clamp(0.0, 1.0));
        }

        // "rtt min/avg/max/mdev = 19.1/20.4/21.7/1.2 ms" or "round-trip min/avg/max/stddev = ..."
        if lower.starts_with("rtt") || lower.starts_with("round-trip") {
            outcome.rtt_ms = line
                .split('=')
                .nth(1)
                .and_then(|stats| stats.trim().split('/').nth(1))
                .and_then(|avg| avg.trim().parse().ok());
        }

        // "Minimum = 19ms, Maximum = 22ms, Average = 20ms"
        if lower.contains("average =") {
            outcome.rtt_ms = line
                .rsplit('=')
                .next()
                .map(|avg| avg.trim().trim_end_matches("ms").trim())
                .and_then(|avg| avg.parse().ok());
        }
    }

    outcome
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OK: &str = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=20.4 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 20.412/20.412/20.412/0.000 ms
";

    const LINUX_LOST: &str = "PING 10.255.255.1 (10.255.255.1) 56(84) bytes of data.

--- 10.255.255.1 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    const MACOS_PARTIAL: &str = "--- 1.1.1.1 ping statistics ---
4 packets transmitted, 3 packets received, 25.0% packet loss
round-trip min/avg/max/stddev = 10.100/12.500/15.900/2.300 ms
";

    const WINDOWS_OK: &str = "Ping statistics for 8.8.8.8:
    Packets: Sent = 1, Received = 1, Lost = 0 (0% loss),
Approximate round trip times in milli-seconds:
    Minimum = 19ms, Maximum = 19ms, Average = 19ms
";

    #[test]
    fn test_parse_linux() {
        let o = parse_ping_output(LINUX_OK);
        assert_eq!(o.rtt_ms, Some(20.412));
        assert_eq!(o.loss, Some(0.0));
    }

    #[test]
    fn test_parse_total_loss() {
        let o = parse_ping_output(LINUX_LOST);
        assert_eq!(o.rtt_ms, None);
        assert_eq!(o.loss, Some(1.0));
    }

    #[test]
    fn test_parse_macos() {
        let o = parse_ping_output(MACOS_PARTIAL);
        assert_eq!(o.rtt_ms, Some(12.5));
        assert_eq!(o.loss, Some(0.25));
    }

    #[test]
    fn test_parse_windows() {
        let o = parse_ping_output(WINDOWS_OK);
        assert_eq!(o.rtt_ms, Some(19.0));
        assert_eq!(o.loss, Some(0.0));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_ping_output("ping: unknown host"), ProbeOutcome::default());
    }

    #[test]
    fn test_aggregate_skips_failed_probes() {
        let report = aggregate(&[
            ProbeOutcome { rtt_ms: Some(20.0), loss: Some(0.0) },
            ProbeOutcome { rtt_ms: None, loss: Some(1.0) },
            ProbeOutcome { rtt_ms: Some(31.0), loss: None },
        ]);
        assert_eq!(report.latency_ms, Some(25.5));
        assert_eq!(report.packet_loss, Some(0.5));
    }

    #[test]
    fn test_aggregate_all_failed_is_absent() {
        let report = aggregate(&[ProbeOutcome::default(), ProbeOutcome::default()]);
        assert_eq!(report, LatencyReport { latency_ms: None, packet_loss: None });
    }
}
