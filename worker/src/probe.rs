//! 能力プローブ
//!
//! CPU/メモリ/ディスク/GPU/パブリック到達性を検査して不変の
//! 能力記述子を生成する。GPUはNVML経由で検出し、NVMLが使えない
//! 環境ではGPUなしとして扱う（エラーにしない）。

use fleet_common::{
    error::{WorkerError, WorkerResult},
    types::Capabilities,
};
use nvml_wrapper::Nvml;
use sysinfo::{Disks, System};
use tracing::debug;

/// GPU検出結果
struct GpuInfo {
    vram_bytes: u64,
}

fn detect_gpu() -> Option<GpuInfo> {
    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(error) => {
            // GPUが存在しない環境やNVMLが利用できない環境
            debug!("GPU probe unavailable: {:?}", error);
            return None;
        }
    };

    let device = nvml.device_by_index(0).ok()?;
    let memory = device.memory_info().ok()?;

    Some(GpuInfo {
        vram_bytes: memory.total,
    })
}

/// 能力記述子を生成する（ノードの生存期間中に一度だけ呼ぶ）
pub fn probe(publicly_reachable: bool) -> WorkerResult<Capabilities> {
    let mut system = System::new_all();
    system.refresh_all();

    let cpu_cores = system.cpus().len() as u32;
    if cpu_cores == 0 {
        return Err(WorkerError::Probe("no CPUs detected".to_string()));
    }

    let ram_bytes = system.total_memory();
    if ram_bytes == 0 {
        return Err(WorkerError::Probe("total memory is zero".to_string()));
    }

    let disks = Disks::new_with_refreshed_list();
    let disk_bytes = disks.iter().map(|d| d.total_space()).sum();

    let gpu = detect_gpu();

    Ok(Capabilities {
        cpu_cores,
        ram_bytes,
        gpu_present: gpu.is_some(),
        gpu_vram_bytes: gpu.map(|g| g.vram_bytes),
        disk_bytes,
        publicly_reachable,
    })
}

/// 負荷サンプラー
///
/// ハートビートに載せる現在負荷（CPU使用率の平均）を収集する。
pub struct LoadSampler {
    system: System,
}

impl LoadSampler {
    /// 新しいサンプラーを作成
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_cpu();
        Self { system }
    }

    /// 現在のCPU使用率（0.0-100.0）を取得
    ///
    /// sysinfoは前回リフレッシュとの差分から使用率を計算するため、
    /// 定期タスクから繰り返し呼ばれる前提。
    pub fn current_load(&mut self) -> f32 {
        self.system.refresh_cpu();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return 0.0;
        }

        cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
    }
}

impl Default for LoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_produces_valid_descriptor() {
        let capabilities = probe(false).unwrap();

        assert!(capabilities.cpu_cores > 0);
        assert!(capabilities.ram_bytes > 0);
        assert!(capabilities.validate().is_ok());
        // GPUなしならVRAMも報告されない
        if !capabilities.gpu_present {
            assert!(capabilities.gpu_vram_bytes.is_none());
        }
    }

    #[test]
    fn test_probe_carries_reachability_flag() {
        assert!(probe(true).unwrap().publicly_reachable);
        assert!(!probe(false).unwrap().publicly_reachable);
    }

    #[test]
    fn test_load_sampler_in_range() {
        let mut sampler = LoadSampler::new();
        let load = sampler.current_load();
        assert!((0.0..=100.0).contains(&load));
    }
}
