//! 計算バックエンドの選択

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::model::config::DeviceType;

/// GPU学習用バックエンド
pub type GpuBackend = Autodiff<Wgpu>;

/// CPU学習用バックエンド
pub type CpuBackend = Autodiff<NdArray>;

pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::default()
}

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// 設定に応じたバックエンド名（ログ用）
pub fn backend_name(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::Wgpu => "Autodiff<Wgpu>",
        DeviceType::Cpu => "Autodiff<NdArray>",
    }
}
