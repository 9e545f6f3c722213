use anyhow::Context;
use clap::{Args, ValueEnum};
use ct_cherry::augment::AugmentSpec;
use ct_cherry::consts::{DEFAULT_FOLDS, DEFAULT_SPLIT_SEED};
use ct_cherry::split::FoldSet;
use nodule_net::network::{
    ClassificationSpec, NetworkSpec, SegmentationSpec, TaskKind, VitSpec,
};
use nodule_net::trainer::{run_training, TrainConfig};
use std::path::PathBuf;

use super::{fold_dir, folds_dir, TrainBackend};

#[derive(Args, Debug)]
pub struct Train {
    /// 实验标识, 同时是结果子目录名.
    #[arg(long = "exp-id", short = 'e')]
    exp_id: String,
    /// 训练任务.
    #[arg(short, long, value_enum, default_value_t = TaskArg::Segmentation)]
    task: TaskArg,
    /// 网络架构.
    #[arg(short, long, value_enum, default_value_t = ArchArg::Cnn)]
    arch: ArchArg,
    /// 训练轮数.
    #[arg(long, default_value_t = 50)]
    epochs: usize,
    /// batch 大小.
    #[arg(long = "batch-size", default_value_t = 4)]
    batch_size: usize,
    /// Adam 学习率.
    #[arg(long = "learning-rate", default_value_t = 1e-4)]
    learning_rate: f64,
    /// fold 总数. 划分文件缺失时按此数目生成.
    #[arg(long, default_value_t = DEFAULT_FOLDS)]
    folds: usize,
    /// 本次训练的 fold 序号, 从 0 计.
    #[arg(long, default_value_t = 0)]
    fold: usize,
    /// 随机种子, 同时用于划分与训练.
    #[arg(long, default_value_t = DEFAULT_SPLIT_SEED)]
    seed: u64,
    /// 关闭训练侧数据增广.
    #[arg(long = "no-augment")]
    no_augment: bool,
    /// dataloader 工作线程数. 缺省时取可用核心数.
    #[arg(long = "num-workers")]
    num_workers: Option<usize>,
    /// 数据集根目录.
    #[arg(long = "data-dir", short = 'D')]
    data_dir: Option<PathBuf>,
    /// 结果根目录.
    #[arg(long = "results-dir", short = 'R')]
    results_dir: Option<PathBuf>,
}

/// 训练任务选项.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum TaskArg {
    /// 结节前景分割.
    Segmentation,
    /// 结节类型四分类.
    Noduletype,
    /// 良恶性二分类.
    Malignancy,
}

impl TaskArg {
    fn kind(self) -> TaskKind {
        match self {
            TaskArg::Segmentation => TaskKind::Segmentation,
            TaskArg::Noduletype => TaskKind::NoduleType,
            TaskArg::Malignancy => TaskKind::Malignancy,
        }
    }
}

/// 网络架构选项.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ArchArg {
    /// 3D 卷积网络.
    Cnn,
    /// 3D ViT (仅分类任务).
    Vit,
}

impl Train {
    pub fn run(&mut self) -> anyhow::Result<()> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(utils::loader::data_dir_from_env_or_home);
        let results_dir = self
            .results_dir
            .clone()
            .unwrap_or_else(utils::loader::results_dir_from_env_or_home);

        let index = utils::loader::index_from(&data_dir)
            .with_context(|| format!("reading case index under {}", data_dir.display()))?;
        let folds = FoldSet::load_or_create(&index, &folds_dir(&results_dir), self.folds, self.seed)?;
        anyhow::ensure!(
            self.fold < folds.len(),
            "fold {} out of range (have {} folds)",
            self.fold,
            folds.len()
        );
        let assignment = folds.fold(self.fold);

        let config = TrainConfig::new(self.exp_id.clone(), self.network()?, self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_seed(self.seed)
            .with_num_workers(self.num_workers.unwrap_or_else(utils::cpus))
            .with_augment(if self.no_augment {
                AugmentSpec::none()
            } else {
                AugmentSpec::light()
            });

        let out_dir = fold_dir(&results_dir, &self.exp_id, self.fold);
        let device = Default::default();
        let report = run_training::<TrainBackend>(&config, &index, assignment, &out_dir, &device)?;

        utils::sep();
        println!("experiment : {} (fold {})", self.exp_id, self.fold);
        println!("epochs run : {}", report.epochs_run);
        match &report.best {
            Some(best) => println!(
                "best {} : {:.4} @ epoch {}",
                config.network.task().metric_name(),
                best.metric,
                best.epoch
            ),
            None => println!("no epoch improved the selection metric"),
        }
        println!("artifacts  : {}", out_dir.display());
        utils::sep();
        Ok(())
    }

    fn network(&self) -> anyhow::Result<NetworkSpec> {
        let spec = match (self.arch, self.task.kind()) {
            (ArchArg::Cnn, TaskKind::Segmentation) => {
                NetworkSpec::Segmentation(SegmentationSpec::standard())
            }
            (ArchArg::Cnn, task) => NetworkSpec::Classification(ClassificationSpec::standard(task)?),
            (ArchArg::Vit, task) => NetworkSpec::Vit(VitSpec::standard(task)?),
        };
        Ok(spec)
    }
}
