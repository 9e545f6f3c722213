#![warn(missing_docs)] // <= 合适时移除它.

//! 网络库. 提供 LUNA23 肺结节任务的 3D 网络构建、训练编排、
//! checkpoint 管理、推理与 Grad-CAM 分析.
//!
//! 该 crate 目前仅提供 `safe` 接口. 将来可能为部分高性能场景关键路径提供 `unsafe` 接口.
//!
//! # 注意
//!
//! 1. 张量计算统一经由 burn, 缺省后端为 CPU 上的 ndarray 实现;
//!   启用 `wgpu` feature 后可用 [`GpuBackend`] 在 GPU 上训练.
//! 2. 在非期望情况下, 程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//!
//! # 开发计划
//!
//! ### 网络工厂 ✅
//!
//! 带 `arch` 标签的网络参数枚举 (卷积分割网 / 卷积分类网 / 3D ViT),
//! 校验后按任务装配输出头; 三种架构共用一个 `Module` 枚举.
//!
//! 实现位于 `nodule-net/src/network`.
//!
//! ### 数据集适配 ✅
//!
//! 把 case 记录接到 burn 的 `Dataset`/`Batcher` 抽象: 懒读取 nii,
//! 裁剪 VOI, 训练侧按 (种子, epoch, 样本序号) 做确定性增广,
//! 堆叠成 `[N, 1, z, H, W]` batch.
//!
//! 实现位于 `nodule-net/src/batch.rs`.
//!
//! ### 损失函数 ✅
//!
//! 软 Dice (整 batch 展平, 平滑项 1.0)、带 logits 的 BCE 与交叉熵,
//! 多头输出逐项求和.
//!
//! 实现位于 `nodule-net/src/loss.rs`.
//!
//! ### 训练编排 ✅
//!
//! 显式状态机 (Initializing / EpochRunning / Validating /
//! Checkpointing / Completed / Failed) 驱动的训练循环: Adam 优化,
//! 每 epoch 验证并按最优指标落 checkpoint, 指标逐行追加 JSON Lines.
//!
//! 实现位于 `nodule-net/src/trainer`.
//!
//! ### checkpoint 管理 ✅
//!
//! burn `CompactRecorder` 权重落盘, `{task}-best.json` 记录最优
//! epoch 元数据, 推理端据此重建模型.
//!
//! 实现位于 `nodule-net/src/checkpoint.rs`.
//!
//! ### 推理 ✅
//!
//! 从实验目录读回配置与最优权重, 逐 case 前向; 分割写二值掩膜
//! npy, 分类写概率表 csv.
//!
//! 实现位于 `nodule-net/src/infer.rs`.
//!
//! ### Grad-CAM ✅
//!
//! 瓶颈特征重标记为梯度叶子, 从目标类得分反传, 通道加权 ReLU
//! 组合后最近邻放大回 VOI 形状.
//!
//! 实现位于 `nodule-net/src/gradcam.rs`.
//!
//! ### nnU-Net 外部命令封装 ✅
//!
//! 组装 `nnUNetv2_predict` 参数与环境目录, 映射退出状态.
//!
//! 实现位于 `nodule-net/src/nnunet.rs`.
//!
//! ### 完善代码文档 ✅
//!
//! 给每个 public API 提供文档, 并视情况给 private API 提供文档.

pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod gradcam;
pub mod infer;
pub mod loss;
pub mod network;
pub mod nnunet;
pub mod trainer;

/// CPU 训练后端: ndarray 之上的自动微分.
pub type CpuBackend = burn::backend::Autodiff<burn::backend::NdArray>;

/// CPU 推理后端.
pub type CpuInferBackend = burn::backend::NdArray;

/// GPU 训练后端.
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// GPU 推理后端.
#[cfg(feature = "wgpu")]
pub type GpuInferBackend = burn::backend::Wgpu;
