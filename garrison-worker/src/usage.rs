//! Host resource metrics.
//!
//! Sampling blocks for a cpu-measurement interval; callers run it on the
//! blocking pool, never on the event loop.

use serde_json::{json, Value};
use sysinfo::{Disks, System};

pub const METRICS: &[&str] = &["cpu", "mem", "load", "disk"];

pub fn is_metric(name: &str) -> bool {
    METRICS.contains(&name.to_ascii_lowercase().as_str())
}

/// Snapshot of cpu/mem/load/disk.
pub fn sample() -> Value {
    let mut sys = System::new_all();
    sys.refresh_all();
    // Cpu usage needs two refreshes a minimum interval apart.
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    let load = System::load_average();
    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = disks
        .iter()
        .fold((0u64, 0u64), |(total, free), disk| {
            (total + disk.total_space(), free + disk.available_space())
        });

    json!({
        "cpu": { "percent": sys.global_cpu_usage(), "cores": sys.cpus().len() },
        "mem": { "total": sys.total_memory(), "used": sys.used_memory() },
        "load": { "one": load.one, "five": load.five, "fifteen": load.fifteen },
        "disk": { "total": disk_total, "free": disk_free },
    })
}

/// Just one of the recognized metrics.
pub fn sample_metric(name: &str) -> Option<Value> {
    let key = name.to_ascii_lowercase();
    sample().get(&key).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_carries_all_metric_sections() {
        let snapshot = sample();
        for metric in METRICS {
            assert!(snapshot.get(*metric).is_some(), "missing {metric}");
        }
        assert!(snapshot["mem"]["total"].as_u64().unwrap() > 0);
    }

    #[test]
    fn single_metric_extraction() {
        assert!(sample_metric("CPU").is_some());
        assert!(sample_metric("disk").is_some());
        assert!(sample_metric("uptime").is_none());
    }

    #[test]
    fn metric_names_recognized_case_insensitively() {
        assert!(is_metric("MEM"));
        assert!(is_metric("load"));
        assert!(!is_metric("swap"));
    }
}
