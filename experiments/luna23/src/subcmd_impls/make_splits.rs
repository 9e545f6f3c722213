use anyhow::Context;
use clap::Args;
use ct_cherry::consts::{NoduleType, DEFAULT_SPLIT_SEED};
use ct_cherry::split::{build_split, SplitSpec, SplitStrategy};
use std::fs;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct MakeSplits {
    /// 数据集根目录. 缺省时从 `$LUNA_DATA_DIR` 或 `$HOME/dataset/luna23` 解析.
    #[arg(long = "data-dir", short = 'D')]
    data_dir: Option<PathBuf>,
    /// 划分文件输出目录. 缺省时写到结果根目录下的 `splits/`.
    #[arg(long = "out-dir", short = 'o')]
    out_dir: Option<PathBuf>,
    /// 验证集比例, 开区间 (0, 1).
    #[arg(long = "valid-fraction", default_value_t = 0.2)]
    valid_fraction: f64,
    /// 随机种子.
    #[arg(long, default_value_t = DEFAULT_SPLIT_SEED)]
    seed: u64,
    /// 训练侧对少数类过采样.
    #[arg(long)]
    oversample: bool,
}

impl MakeSplits {
    pub fn run(&mut self) -> anyhow::Result<()> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(utils::loader::data_dir_from_env_or_home);
        let out_dir = self
            .out_dir
            .clone()
            .unwrap_or_else(|| utils::loader::results_dir_from_env_or_home().join("splits"));

        let index = utils::loader::index_from(&data_dir)
            .with_context(|| format!("reading case index under {}", data_dir.display()))?;
        let strategy = if self.oversample {
            SplitStrategy::OversampleMinority
        } else {
            SplitStrategy::Stratified
        };
        let spec = SplitSpec::new(self.valid_fraction, self.seed, strategy)?;
        let split = build_split(&index, &spec)?;

        fs::create_dir_all(&out_dir)?;
        let train_path = out_dir.join("train.csv");
        let valid_path = out_dir.join("valid.csv");
        split.save(&train_path, &valid_path)?;

        let histogram = index.type_histogram();
        utils::sep();
        println!("cases: {} ({} malignant)", index.len(), index.malignant_count());
        for ty in NoduleType::ALL {
            println!("  {:<11} {}", ty.name(), histogram[ty.index()]);
        }
        utils::sep();
        println!("train: {:>4} -> {}", split.train().len(), train_path.display());
        println!("valid: {:>4} -> {}", split.valid().len(), valid_path.display());
        utils::sep();
        Ok(())
    }
}
