//! Resource statistics collection

use bollard::container::{CPUStats, MemoryStats, StatsOptions};
#[cfg(test)]
use bollard::container::{CPUUsage, ThrottlingData};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use crate::models::ResourceUsage;

/// Take a single stats sample from a container and compute usage figures.
///
/// Returns `None` when the runtime yields no sample (container gone or the
/// stats endpoint erroring), in which case the status simply carries no
/// resource usage.
pub(super) async fn sample(client: &Docker, container_id: &str) -> Option<ResourceUsage> {
    let options = StatsOptions {
        stream: false,
        one_shot: false,
    };

    let mut stream = client.stats(container_id, Some(options));
    match stream.next().await {
        Some(Ok(stats)) => Some(calculate_resource_usage(
            &stats.cpu_stats,
            &stats.precpu_stats,
            &stats.memory_stats,
        )),
        Some(Err(e)) => {
            debug!("Failed to read stats from {}: {}", container_id, e);
            None
        }
        None => None,
    }
}

/// Compute usage figures from one stats sample.
///
/// CPU deltas are current minus the previous sample embedded in the same
/// snapshot; memory percent is usage over limit.
pub fn calculate_resource_usage(
    cpu: &CPUStats,
    precpu: &CPUStats,
    memory: &MemoryStats,
) -> ResourceUsage {
    let cpu_delta = cpu
        .cpu_usage
        .total_usage
        .saturating_sub(precpu.cpu_usage.total_usage);
    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(precpu.system_cpu_usage.unwrap_or(0));

    let memory_usage = memory.usage.unwrap_or(0);
    let memory_limit = memory.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        round2(memory_usage as f64 / memory_limit as f64 * 100.0)
    } else {
        0.0
    };

    ResourceUsage {
        cpu_percent: calculate_cpu_percent(cpu_delta, system_delta),
        memory_usage_mb: round2(memory_usage as f64 / 1024.0 / 1024.0),
        memory_limit_mb: round2(memory_limit as f64 / 1024.0 / 1024.0),
        memory_percent,
    }
}

/// CPU percentage from usage deltas: `(cpu_delta / system_delta) * 100`,
/// zero when no system time elapsed.
pub fn calculate_cpu_percent(cpu_delta: u64, system_delta: u64) -> f64 {
    if system_delta > 0 {
        round2(cpu_delta as f64 / system_delta as f64 * 100.0)
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_cpu_percent() {
        assert_eq!(calculate_cpu_percent(500, 2000), 25.00);
        assert_eq!(calculate_cpu_percent(500, 0), 0.0);
        assert_eq!(calculate_cpu_percent(0, 2000), 0.0);
        // Rounded to two decimal places.
        assert_eq!(calculate_cpu_percent(1, 3), 33.33);
    }

    fn empty_cpu_stats() -> CPUStats {
        CPUStats {
            cpu_usage: CPUUsage {
                percpu_usage: None,
                usage_in_usermode: 0,
                total_usage: 0,
                usage_in_kernelmode: 0,
            },
            system_cpu_usage: None,
            online_cpus: None,
            throttling_data: ThrottlingData {
                periods: 0,
                throttled_periods: 0,
                throttled_time: 0,
            },
        }
    }

    fn empty_memory_stats() -> MemoryStats {
        MemoryStats {
            stats: None,
            max_usage: None,
            usage: None,
            failcnt: None,
            limit: None,
            commit: None,
            commit_peak: None,
            commitbytes: None,
            commitpeakbytes: None,
            privateworkingset: None,
        }
    }

    #[test]
    fn test_calculate_resource_usage() {
        let mut cpu = empty_cpu_stats();
        cpu.cpu_usage.total_usage = 2500;
        cpu.system_cpu_usage = Some(10_000);

        let mut precpu = empty_cpu_stats();
        precpu.cpu_usage.total_usage = 2000;
        precpu.system_cpu_usage = Some(8_000);

        let mut memory = empty_memory_stats();
        memory.usage = Some(256 * 1024 * 1024);
        memory.limit = Some(512 * 1024 * 1024);

        let usage = calculate_resource_usage(&cpu, &precpu, &memory);
        assert_eq!(usage.cpu_percent, 25.00);
        assert_eq!(usage.memory_usage_mb, 256.0);
        assert_eq!(usage.memory_limit_mb, 512.0);
        assert_eq!(usage.memory_percent, 50.0);
    }

    #[test]
    fn test_resource_usage_without_samples() {
        let usage = calculate_resource_usage(
            &empty_cpu_stats(),
            &empty_cpu_stats(),
            &empty_memory_stats(),
        );
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_usage_mb, 0.0);
        assert_eq!(usage.memory_percent, 0.0);
    }
}
