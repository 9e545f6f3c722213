#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供 LUNA23 肺结节数据集的结构化索引、3D CT 读取与 VOI
//! 提取、数据增广、数据集划分和评估指标.
//!
//! 该 crate 目前仅提供 `safe` 接口. 将来可能为部分高性能场景关键路径提供 `unsafe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 主要面向 LUNA23 模式组织的数据 (labels.csv + image/ + mask/),
//!   没有对其它源的数据进行直接适配 (但如果新数据按照该模式组织, 也可以工作).
//! 2. 在非期望情况下, 程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//!
//! # 开发计划
//!
//! ### labels 表索引 ✅
//!
//! 解析 labels.csv (caseid / noduletype / malignancy / 文件路径 / 可选体素中心),
//! 校验必需列并收集文件缺失信息.
//!
//! 实现位于 `ct-cherry/src/dataset/index.rs`.
//!
//! ### 3D CT 读取与 VOI 提取 ✅
//!
//! nii 读取统一转为 `(z, H, W)` 布局; 以标注中心 (或 mask 质心)
//! 为锚点做确定性的定尺寸裁剪 + padding, 输出 `(64, 128, 128)` VOI.
//!
//! 实现位于 `ct-cherry/src/data/*`.
//!
//! ### HU 窗口归一化 ✅
//!
//! 提供一个独立的 HU 窗口对象, 以便将 CT HU 值裁剪并归一化到 `[0, 1]`.
//!
//! 实现位于 `ct-cherry/src/data/window.rs`.
//!
//! ### 数据增广 ✅
//!
//! 翻转、水平面旋转、平移、强度缩放与高斯噪声, 按固定顺序执行;
//! 空间变换对 image/mask 保持一致, 随机性由 per-sample 种子完全确定.
//!
//! 实现位于 `ct-cherry/src/augment`.
//!
//! ### 数据集划分 ✅
//!
//! patient 级分层 train/valid 划分与 5-fold 交叉验证折的生成与持久化.
//! 相同种子下结果逐字节可复现.
//!
//! 实现位于 `ct-cherry/src/split`.
//!
//! ### 评估指标 ✅
//!
//! Dice 系数、balanced accuracy、ROC AUC.
//!
//! 实现位于 `ct-cherry/src/metrics.rs`.
//!
//! ### 完善代码文档 ✅
//!
//! 给每个 public API 提供文档, 并视情况给 private API 提供文档.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 三维有符号偏移量. 平移增广等场景会用到.
pub type Off3d = (isize, isize, isize);

/// 3D CT nii 文件基础数据结构.
mod data;

pub use data::{
    save_heat_overlay, HuWindow, MaskSlice, MaskVolume, NiftiMeta, ScanSlice, ScanVolume,
    SliceWriteRaw, SliceWriteVis, VoiSample, VoiSpec, VolumePair,
};

pub mod consts;

pub mod augment;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod prelude;
pub mod split;
