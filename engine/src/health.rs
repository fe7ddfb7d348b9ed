//! Resource health monitoring.
//!
//! A [`HealthMonitor`] samples CPU, memory and destination-disk utilisation
//! on its own thread and publishes only the latest sample. The run loop
//! reads that slot before each file and backs off while any metric is over
//! its threshold.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, warn};

/// One utilisation reading, each value in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// `None` when the disk holding the destination could not be identified
    pub disk_percent: Option<f32>,
}

/// Utilisation above which transfers are paused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        ResourceThresholds {
            cpu_percent: 90.0,
            memory_percent: 90.0,
            disk_percent: 90.0,
        }
    }
}

impl ResourceThresholds {
    /// Describe every metric of `sample` that exceeds its threshold.
    pub fn violations(&self, sample: &ResourceSample) -> Vec<String> {
        let mut over = Vec::new();
        if sample.cpu_percent > self.cpu_percent {
            over.push(format!(
                "cpu {:.1}% > {:.1}%",
                sample.cpu_percent, self.cpu_percent
            ));
        }
        if sample.memory_percent > self.memory_percent {
            over.push(format!(
                "memory {:.1}% > {:.1}%",
                sample.memory_percent, self.memory_percent
            ));
        }
        if let Some(disk) = sample.disk_percent {
            if disk > self.disk_percent {
                over.push(format!("disk {:.1}% > {:.1}%", disk, self.disk_percent));
            }
        }
        over
    }
}

/// Source of resource readings.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSample;

    /// Free bytes on the disk holding the destination, if known.
    fn available_bytes(&mut self) -> Option<u64>;
}

/// Builds the sampler for a run from its destination root.
pub type SamplerFactory = Box<dyn Fn(&Path) -> Box<dyn ResourceSampler> + Send>;

/// Sampler backed by the operating system.
pub struct SystemSampler {
    system: System,
    disks: Disks,
    target: PathBuf,
    cpu_refreshed_at: Instant,
}

impl SystemSampler {
    /// Sample the machine, measuring disk usage for the disk holding `target`.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        SystemSampler {
            system,
            disks: Disks::new_with_refreshed_list(),
            target: target.into(),
            cpu_refreshed_at: Instant::now(),
        }
    }

    /// CPU usage is a delta between two refreshes, which sysinfo only
    /// measures once they are `MINIMUM_CPU_UPDATE_INTERVAL` apart.
    fn refresh_cpu(&mut self) {
        let since = self.cpu_refreshed_at.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.system.refresh_cpu();
        self.cpu_refreshed_at = Instant::now();
    }

    /// (total, available) bytes of the disk with the longest mount point
    /// that contains the target.
    fn target_disk(&self) -> Option<(u64, u64)> {
        let target = existing_ancestor(&self.target);
        self.disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| (disk.total_space(), disk.available_space()))
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        self.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh();

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        };

        let disk_percent = self.target_disk().and_then(|(total, available)| {
            if total == 0 {
                None
            } else {
                Some(((total - available.min(total)) as f64 / total as f64 * 100.0) as f32)
            }
        });

        ResourceSample {
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            memory_percent,
            disk_percent,
        }
    }

    fn available_bytes(&mut self) -> Option<u64> {
        self.disks.refresh();
        self.target_disk().map(|(_, available)| available)
    }
}

/// Canonical form of the deepest existing ancestor of `path`.
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Background sampler plus the latest-sample slot it writes.
pub struct HealthMonitor {
    latest: Arc<RwLock<Option<ResourceSample>>>,
    thresholds: ResourceThresholds,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Take a first sample immediately, then keep sampling every `interval`
    /// on a dedicated thread until the monitor is dropped.
    pub fn start(
        mut sampler: Box<dyn ResourceSampler>,
        thresholds: ResourceThresholds,
        interval: Duration,
    ) -> Self {
        let latest = Arc::new(RwLock::new(Some(sampler.sample())));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let slot = Arc::clone(&latest);
        let spawned = thread::Builder::new()
            .name("health-monitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let sample = sampler.sample();
                        if let Ok(mut guard) = slot.write() {
                            *guard = Some(sample);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Could not start health sampler thread, using first sample only");
                None
            }
        };

        HealthMonitor {
            latest,
            thresholds,
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        self.latest.read().ok().and_then(|guard| *guard)
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    /// True when any metric of the latest sample exceeds its threshold.
    pub fn should_throttle(&self) -> bool {
        self.throttle_reason().is_some()
    }

    /// The exceeded metrics, joined, or `None` when healthy.
    pub fn throttle_reason(&self) -> Option<String> {
        let sample = self.latest()?;
        let over = self.thresholds.violations(&sample);
        if over.is_empty() {
            None
        } else {
            Some(over.join(", "))
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        // Dropping the sender wakes the sampler immediately
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Health sampler thread panicked");
            }
        }
        debug!("Health monitor stopped");
    }
}

/// Sampler returning fixed readings; for tests and for running without
/// resource checks.
#[derive(Debug, Clone)]
pub struct FixedSampler {
    pub sample: ResourceSample,
    pub available: Option<u64>,
}

impl FixedSampler {
    /// A machine that is idle and has unlimited space.
    pub fn healthy() -> Self {
        FixedSampler {
            sample: ResourceSample {
                cpu_percent: 5.0,
                memory_percent: 20.0,
                disk_percent: Some(10.0),
            },
            available: None,
        }
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> ResourceSample {
        self.sample
    }

    fn available_bytes(&mut self) -> Option<u64> {
        self.available
    }
}
