//! burnバックエンドの選択

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::model::DeviceType;

/// CPU推論・評価用バックエンド
pub type CpuBackend = NdArray<f32>;
/// CPU学習用バックエンド
pub type CpuTrainBackend = Autodiff<CpuBackend>;
/// GPU推論・評価用バックエンド
pub type GpuBackend = Wgpu;
/// GPU学習用バックエンド
pub type GpuTrainBackend = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::DefaultDevice
}

/// 設定値の表示用
pub fn describe(device_type: &DeviceType) -> String {
    match device_type {
        DeviceType::Wgpu => format!("{} / {:?}", device_type, gpu_device()),
        DeviceType::Cpu => format!("{} / {:?}", device_type, cpu_device()),
    }
}
