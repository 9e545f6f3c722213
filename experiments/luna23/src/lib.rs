#![warn(missing_docs)] // <= 合适时移除它.

//! LUNA23 肺结节 CT 实验命令行.
//!
//! 子命令覆盖数据划分、训练、推理与结果分析的完整实验流程.
//! 算法逻辑在 `ct-cherry` 与 `nodule-net` 中实现, 本 crate 只负责
//! 参数解析、路径组织与结果汇报.

pub mod subcmd_impls;

pub use subcmd_impls::args::Cli;
