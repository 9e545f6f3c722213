//! 子命令实现.

pub mod args;
mod curves;
mod grad_cam;
mod infer;
mod make_splits;
mod nnunet_predict;
mod train;

use std::path::{Path, PathBuf};

/// 自动微分后端. 训练与 Grad-CAM 使用.
#[cfg(not(feature = "wgpu"))]
type TrainBackend = nodule_net::CpuBackend;
#[cfg(feature = "wgpu")]
type TrainBackend = nodule_net::GpuBackend;

/// 纯前向推理后端.
#[cfg(not(feature = "wgpu"))]
type InferBackend = nodule_net::CpuInferBackend;
#[cfg(feature = "wgpu")]
type InferBackend = nodule_net::GpuInferBackend;

/// 单次实验目录: `{results}/{exp_id}/fold{k}`.
fn fold_dir(results: &Path, exp_id: &str, fold: usize) -> PathBuf {
    results.join(exp_id).join(format!("fold{fold}"))
}

/// fold 划分文件所在目录: `{results}/folds`. 各实验共享同一套划分.
fn folds_dir(results: &Path) -> PathBuf {
    results.join("folds")
}
