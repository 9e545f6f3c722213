//! 命令行参数定义与分发.

use clap::{Parser, Subcommand};

/// 命令行入口.
#[derive(Parser, Debug)]
#[command(name = "luna23")]
#[command(about = "LUNA23 肺结节 CT 数据集的训练与分析工具集.")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// 子命令.
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// 运行所选子命令.
    pub fn run_program(&mut self) -> anyhow::Result<()> {
        match self.command {
            Commands::MakeSplits(ref mut v) => v.run(),
            Commands::Train(ref mut v) => v.run(),
            Commands::Infer(ref mut v) => v.run(),
            Commands::NnunetPredict(ref mut v) => v.run(),
            Commands::Curves(ref mut v) => v.run(),
            Commands::GradCam(ref mut v) => v.run(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 构建分层 train/valid 划分并写出 csv 文件.
    MakeSplits(crate::subcmd_impls::make_splits::MakeSplits),
    /// 在一个 fold 上训练网络, 按需先生成 fold 划分.
    Train(crate::subcmd_impls::train::Train),
    /// 用最优 checkpoint 对验证集或指定 case 推理.
    Infer(crate::subcmd_impls::infer::Infer),
    /// 调用外部 nnU-Net 预测命令.
    NnunetPredict(crate::subcmd_impls::nnunet_predict::NnunetPredict),
    /// 从 metrics.jsonl 绘制损失与指标曲线.
    Curves(crate::subcmd_impls::curves::Curves),
    /// 为单个 case 生成 Grad-CAM 热力体与叠加图.
    GradCam(crate::subcmd_impls::grad_cam::GradCam),
}
