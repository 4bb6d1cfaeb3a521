//! Host implementations of the platform traits.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use beecounter_core::events::{PerformanceSnapshot, SystemMonitor};
use beecounter_core::network::SystemControl;
use beecounter_core::storage::ImageStore;
use tokio::sync::Notify;

/// Cumulative jiffies for one `cpuN` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Parse the first two per-core lines of `/proc/stat`.
pub fn parse_proc_stat(text: &str) -> [CpuTimes; 2] {
    let mut cores = [CpuTimes::default(); 2];
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let index = match label {
            "cpu0" => 0,
            "cpu1" => 1,
            _ => continue,
        };
        let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        let total: u64 = values.iter().sum();
        // idle + iowait
        let idle = values.get(3).copied().unwrap_or(0) + values.get(4).copied().unwrap_or(0);
        cores[index] = CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        };
    }
    cores
}

/// Value in kB of a `Key:   123 kB` line (`/proc/meminfo`, `/proc/self/status`).
pub fn parse_kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn usage_percent(previous: CpuTimes, current: CpuTimes) -> f32 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let busy = current.busy.saturating_sub(previous.busy);
    (busy as f32 / total as f32 * 100.0).clamp(0.0, 100.0)
}

/// Resource figures from procfs: process RSS as heap, image bytes as flash.
pub struct HostMonitor {
    images: Arc<ImageStore>,
    thermal_zone: PathBuf,
    last_cpu: Mutex<Option<[CpuTimes; 2]>>,
}

impl HostMonitor {
    pub fn new(images: Arc<ImageStore>) -> Self {
        Self {
            images,
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_usage(&self) -> [f32; 2] {
        let Ok(text) = fs::read_to_string("/proc/stat") else {
            return [0.0; 2];
        };
        let current = parse_proc_stat(&text);
        let Ok(mut last) = self.last_cpu.lock() else {
            return [0.0; 2];
        };
        let usage = match *last {
            Some(previous) => [
                usage_percent(previous[0], current[0]),
                usage_percent(previous[1], current[1]),
            ],
            None => [0.0; 2],
        };
        *last = Some(current);
        usage
    }
}

impl SystemMonitor for HostMonitor {
    fn snapshot(&self) -> PerformanceSnapshot {
        let [cpu_core_0, cpu_core_1] = self.cpu_usage();
        let heap_used = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| parse_kb_field(&s, "VmRSS"))
            .unwrap_or(0)
            * 1024;
        let heap_total = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_kb_field(&s, "MemTotal"))
            .unwrap_or(0)
            * 1024;
        let flash_used = self.images.usage().map(|u| u.bytes).unwrap_or(0);
        let cpu_temp = fs::read_to_string(&self.thermal_zone)
            .ok()
            .and_then(|s| s.trim().parse::<f32>().ok())
            .map(|milli| milli / 1000.0);
        PerformanceSnapshot {
            cpu_core_0,
            cpu_core_1,
            heap_used,
            heap_total,
            flash_used,
            // Unknown on the host; the page shows used bytes only.
            flash_total: 0,
            wifi_rssi: None,
            cpu_temp,
        }
    }
}

/// Restart on the host means a clean exit; the service manager restarts us.
#[derive(Clone, Default)]
pub struct ProcessControl {
    stopping: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag polled by the scheduler thread.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn stopped(&self) {
        if !self.stopping.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

impl SystemControl for ProcessControl {
    fn restart(&self, reason: &str) {
        tracing::warn!(reason, "restart requested, shutting down");
        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let text = "cpu  10 0 10 80 0 0 0 0 0 0\n\
                    cpu0 5 0 5 40 0 0 0 0 0 0\n\
                    cpu1 1 0 1 7 1 0 0 0 0 0\n";
        let cores = parse_proc_stat(text);
        assert_eq!(cores[0], CpuTimes { busy: 10, total: 50 });
        assert_eq!(cores[1], CpuTimes { busy: 2, total: 10 });
    }

    #[test]
    fn test_usage_percent() {
        let a = CpuTimes { busy: 10, total: 100 };
        let b = CpuTimes { busy: 35, total: 200 };
        assert_eq!(usage_percent(a, b), 25.0);
        assert_eq!(usage_percent(b, b), 0.0);
    }

    #[test]
    fn test_parse_kb_field() {
        let text = "MemTotal:       16314328 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_kb_field(text, "MemTotal"), Some(16_314_328));
        assert_eq!(parse_kb_field(text, "Swap"), None);
    }

    #[tokio::test]
    async fn test_restart_wakes_waiter() {
        let control = ProcessControl::new();
        control.restart("test");
        control.stopped().await;
        assert!(control.stop_flag().load(Ordering::SeqCst));
    }
}
