use anyhow::Context;
use clap::Args;
use ct_cherry::dataset::{CaseIndex, CaseRecord};
use ct_cherry::split::{FoldSet, SplitAssignment};
use either::Either;
use nodule_net::infer::{run_inference, MASKS_DIR, PREDICTIONS_FILE};
use std::path::{Path, PathBuf};

use super::{fold_dir, folds_dir, InferBackend};

#[derive(Args, Debug)]
pub struct Infer {
    /// 实验标识.
    #[arg(long = "exp-id", short = 'e')]
    exp_id: String,
    /// fold 序号, 从 0 计.
    #[arg(long, default_value_t = 0)]
    fold: usize,
    /// 只推理给定 case (可多次给出). 缺省时推理该 fold 的整个验证集.
    #[arg(long = "case", short = 'c')]
    cases: Vec<String>,
    /// 数据集根目录.
    #[arg(long = "data-dir", short = 'D')]
    data_dir: Option<PathBuf>,
    /// 结果根目录.
    #[arg(long = "results-dir", short = 'R')]
    results_dir: Option<PathBuf>,
}

impl Infer {
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
        let cases = self.requested_cases(&index, &results_dir)?;
        anyhow::ensure!(!cases.is_empty(), "nothing to infer: case list is empty");

        let exp_dir = fold_dir(&results_dir, &self.exp_id, self.fold);
        let out_dir = exp_dir.join("predictions");
        let device = Default::default();
        let outcome = run_inference::<InferBackend>(&exp_dir, &cases, &out_dir, &device)?;

        utils::sep();
        match outcome {
            Either::Left(masks) => {
                println!(
                    "masks written: {} -> {}",
                    masks.len(),
                    out_dir.join(MASKS_DIR).display()
                );
                let with_dice: Vec<f64> = masks.iter().filter_map(|m| m.dice).collect();
                if !with_dice.is_empty() {
                    let mean = with_dice.iter().sum::<f64>() / with_dice.len() as f64;
                    println!("mean dice over {} labelled cases: {:.4}", with_dice.len(), mean);
                }
            }
            Either::Right(scores) => {
                println!(
                    "scores written: {} -> {}",
                    scores.len(),
                    out_dir.join(PREDICTIONS_FILE).display()
                );
            }
        }
        utils::sep();
        Ok(())
    }

    /// 解析本次要推理的 case 列表.
    fn requested_cases(
        &self,
        index: &CaseIndex,
        results_dir: &Path,
    ) -> anyhow::Result<Vec<CaseRecord>> {
        if self.cases.is_empty() {
            let (train_path, valid_path) = FoldSet::fold_paths(&folds_dir(results_dir), self.fold);
            let assignment = SplitAssignment::load(&train_path, &valid_path).with_context(|| {
                format!("loading fold {} split files (run `luna23 train` first)", self.fold)
            })?;
            Ok(assignment.valid_records(index))
        } else {
            let mut ans = Vec::with_capacity(self.cases.len());
            for id in &self.cases {
                let record = index
                    .get(id)
                    .with_context(|| format!("unknown case id `{id}`"))?;
                ans.push(record.clone());
            }
            Ok(ans)
        }
    }
}
