//! Host metrics for relay node heartbeats
//!
//! - CPU utilization over a short sampling window
//! - Memory and root filesystem usage
//! - Cumulative network counters summed over interfaces
//! - Latency and packet loss to reference targets (see `probe`)

pub mod probe;

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};
use tracing::debug;

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: f64,
    pub used_mb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskMetrics {
    pub total_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkMetrics {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

/// Resource usage at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
}

impl SystemSnapshot {
    /// Blocks (asynchronously) for `cpu_window` to get a meaningful CPU reading.
    pub async fn collect(cpu_window: Duration) -> Result<Self> {
        debug!("Collecting system metrics...");

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(cpu_window).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let usage = sys.global_cpu_info().cpu_usage() as f64;
        let cpu = CpuMetrics { usage_percent: round2(usage.clamp(0.0, 100.0)) };

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        let memory = MemoryMetrics {
            total_mb: round2(total / MB),
            used_mb: round2(used / MB),
            percent: percent(used, total),
        };

        let disks = Disks::new_with_refreshed_list();
        let volumes: Vec<(&Path, u64, u64)> = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()))
            .collect();
        let disk = summarize_disks(&volumes);

        let networks = Networks::new_with_refreshed_list();
        let network = networks.iter().fold(NetworkMetrics::default(), |mut acc, (_, data)| {
            acc.bytes_sent += data.total_transmitted();
            acc.bytes_recv += data.total_received();
            acc.packets_sent += data.total_packets_transmitted();
            acc.packets_recv += data.total_packets_received();
            acc
        });

        Ok(SystemSnapshot { cpu, memory, disk, network })
    }
}

/// Root filesystem if mounted, else the sum of every listed volume.
fn summarize_disks(volumes: &[(&Path, u64, u64)]) -> DiskMetrics {
    let root = volumes.iter().find(|(mount, _, _)| *mount == Path::new("/"));
    let (total, available) = match root {
        Some(&(_, total, available)) => (total, available),
        None => volumes
            .iter()
            .fold((0, 0), |(t, a), &(_, total, available)| (t + total, a + available)),
    };
    let used = total.saturating_sub(available) as f64;
    DiskMetrics {
        total_gb: round2(total as f64 / GB),
        used_gb: round2(used / GB),
        percent: percent(used, total as f64),
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        round2((used / total * 100.0).clamp(0.0, 100.0))
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
