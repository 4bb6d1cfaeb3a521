//! Watchdog, restart, flash filesystem and resource monitor.

use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use beecounter_core::events::{PerformanceSnapshot, SystemMonitor};
use beecounter_core::network::{NetworkLink, SystemControl};
use beecounter_core::scheduler::Watchdog;
use esp_idf_svc::hal::cpu::Core;
use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::sys::{
    self, esp, esp_get_free_heap_size, esp_restart, esp_spiffs_info, esp_task_wdt_add,
    esp_task_wdt_reset, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register, heap_caps_get_total_size,
    MALLOC_CAP_DEFAULT,
};
use log::{info, warn};

/// Task watchdog subscription for the thread that creates it.
///
/// Must be created on the scheduler thread: `esp_task_wdt_add(NULL)`
/// subscribes the calling task.
pub struct TaskWatchdog(());

impl TaskWatchdog {
    pub fn subscribe_current() -> Result<Self> {
        esp!(unsafe { esp_task_wdt_add(std::ptr::null_mut()) })?;
        Ok(Self(()))
    }
}

impl Watchdog for TaskWatchdog {
    fn feed(&self) {
        unsafe { esp_task_wdt_reset() };
    }
}

/// `esp_restart` after a short delay so the HTTP response can flush.
pub struct EspRestart;

impl SystemControl for EspRestart {
    fn restart(&self, reason: &str) {
        warn!("Restarting: {}", reason);
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(500));
            unsafe { esp_restart() };
        });
    }

    fn apply_timezone(&self, tz: &str) {
        beecounter_core::clock::set_local_timezone(tz);
        // newlib caches the zone for localtime().
        unsafe { sys::tzset() };
        info!("Timezone set to {}", tz);
    }
}

/// Mount the SPIFFS data partition at `base_path`.
pub fn mount_spiffs(base_path: &str, partition_label: &str) -> Result<FlashFs> {
    let base = CString::new(base_path)?;
    let label = CString::new(partition_label)?;
    let conf = esp_vfs_spiffs_conf_t {
        base_path: base.as_ptr(),
        partition_label: label.as_ptr(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    esp!(unsafe { esp_vfs_spiffs_register(&conf) })?;
    info!("Mounted SPIFFS partition '{}' at {}", partition_label, base_path);
    Ok(FlashFs { label })
}

/// Mounted data partition.
pub struct FlashFs {
    label: CString,
}

impl FlashFs {
    /// `(total, used)` bytes, or zeros if the driver cannot tell.
    pub fn info(&self) -> (u64, u64) {
        let mut total = 0usize;
        let mut used = 0usize;
        let rc = unsafe { esp_spiffs_info(self.label.as_ptr(), &mut total, &mut used) };
        if rc == sys::ESP_OK as i32 {
            (total as u64, used as u64)
        } else {
            (0, 0)
        }
    }
}

/// Idle counters, one per core, incremented by lowest-priority threads.
///
/// A fully idle core lets its counter advance once per RTOS tick.
pub struct IdleCounters {
    counts: [Arc<AtomicU64>; 2],
    last: Mutex<([u64; 2], Instant)>,
}

impl IdleCounters {
    /// Spawn the two pinned counting threads.
    pub fn start() -> Result<Self> {
        let counts = [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))];
        for (core, counter) in [Core::Core0, Core::Core1].into_iter().zip(counts.iter()) {
            ThreadSpawnConfiguration {
                name: Some(b"idle_count\0"),
                stack_size: 1024,
                priority: 1,
                pin_to_core: Some(core),
                ..Default::default()
            }
            .set()?;
            let counter = counter.clone();
            std::thread::spawn(move || loop {
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            });
        }
        ThreadSpawnConfiguration::default().set()?;
        Ok(Self {
            counts,
            last: Mutex::new(([0, 0], Instant::now())),
        })
    }

    /// Busy percentage per core since the previous call.
    pub fn usage(&self) -> [f32; 2] {
        let now = [
            self.counts[0].load(Ordering::Relaxed),
            self.counts[1].load(Ordering::Relaxed),
        ];
        let Ok(mut last) = self.last.lock() else {
            return [0.0; 2];
        };
        let elapsed = last.1.elapsed().as_secs_f32();
        let ideal = elapsed * sys::configTICK_RATE_HZ as f32;
        let usage = if ideal > 0.0 {
            [0, 1].map(|i| {
                let idle = now[i].saturating_sub(last.0[i]) as f32;
                (100.0 - idle * 100.0 / ideal).clamp(0.0, 100.0)
            })
        } else {
            [0.0; 2]
        };
        *last = (now, Instant::now());
        usage
    }
}

pub struct EspMonitor {
    idle: IdleCounters,
    flash: FlashFs,
    link: Arc<dyn NetworkLink>,
}

impl EspMonitor {
    pub fn new(idle: IdleCounters, flash: FlashFs, link: Arc<dyn NetworkLink>) -> Self {
        Self { idle, flash, link }
    }
}

impl SystemMonitor for EspMonitor {
    fn snapshot(&self) -> PerformanceSnapshot {
        let [cpu_core_0, cpu_core_1] = self.idle.usage();
        let heap_total = unsafe { heap_caps_get_total_size(MALLOC_CAP_DEFAULT) } as u64;
        let heap_free = unsafe { esp_get_free_heap_size() } as u64;
        let (flash_total, flash_used) = self.flash.info();
        PerformanceSnapshot {
            cpu_core_0,
            cpu_core_1,
            heap_used: heap_total.saturating_sub(heap_free),
            heap_total,
            flash_used,
            flash_total,
            wifi_rssi: self.link.rssi(),
            // No temperature sensor driver is configured on this board.
            cpu_temp: None,
        }
    }
}

