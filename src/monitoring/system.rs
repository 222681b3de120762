use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;

const SAMPLE_DEADLINE: Duration = Duration::from_secs(2);

/// 主机 CPU 与内存使用率（百分比）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl SystemUsage {
    pub fn cpu_u8(&self) -> u8 {
        to_percent(self.cpu_percent)
    }

    pub fn memory_u8(&self) -> u8 {
        to_percent(self.memory_percent)
    }
}

fn to_percent(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// 系统资源采样器，System 在多次采样间复用以得到 CPU 差值
pub struct SystemMonitor {
    system: Arc<Mutex<Option<System>>>,
    enable_cpu: bool,
    enable_memory: bool,
}

impl SystemMonitor {
    pub fn new(enable_cpu: bool, enable_memory: bool) -> Self {
        Self {
            system: Arc::new(Mutex::new(None)),
            enable_cpu,
            enable_memory,
        }
    }

    /// 采样一次，最多等待 2 秒
    pub async fn sample(&self) -> Result<SystemUsage> {
        let system = self.system.clone();
        let (enable_cpu, enable_memory) = (self.enable_cpu, self.enable_memory);

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = system
                .lock()
                .map_err(|_| anyhow::anyhow!("system sampler lock poisoned"))?;
            let first = guard.is_none();
            let sys = guard.get_or_insert_with(System::new);
            Ok::<_, anyhow::Error>(collect(sys, first, enable_cpu, enable_memory))
        });

        tokio::time::timeout(SAMPLE_DEADLINE, task)
            .await
            .context("system sampling timed out")?
            .context("system sampling task failed")?
    }
}

fn collect(sys: &mut System, first: bool, enable_cpu: bool, enable_memory: bool) -> SystemUsage {
    let mut usage = SystemUsage::default();

    if enable_cpu {
        sys.refresh_cpu_usage();
        if first {
            // CPU 使用率需要两次刷新之间的差值
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_cpu_usage();
        }
        usage.cpu_percent = sys.global_cpu_usage();
    }

    if enable_memory {
        sys.refresh_memory();
        let total = sys.total_memory();
        if total > 0 {
            usage.memory_percent = (sys.used_memory() as f64 / total as f64 * 100.0) as f32;
        }
    }

    usage
}
