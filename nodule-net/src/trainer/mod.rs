//! 训练编排.
//!
//! 训练过程建模为显式状态机 [`TrainPhase`]:
//!
//! ```text
//! Initializing -> EpochRunning(0) -> Validating(0) -> Checkpointing(0)
//!                       ^                                   |
//!                       +---------- (epoch + 1) ------------+
//! Initializing | Checkpointing -> Completed
//! 任意非终态 -> Failed
//! ```
//!
//! [`run_training`] 驱动该状态机: 校验配置并持久化到实验目录,
//! 审计划分文件, 随后逐 epoch 训练、验证、按最优指标落 checkpoint.
//! 0 epoch 的配置在初始化后直接进入 `Completed`, 不写任何权重.
//! 任何不可恢复错误使状态机进入 `Failed` 并把错误原样抛给调用方,
//! 已写出的 checkpoint 留在盘上.

mod config;

pub use config::{TrainConfig, TRAIN_CONFIG_FILE};

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use ct_cherry::augment::Augmenter;
use ct_cherry::consts::NUM_NODULE_TYPES;
use ct_cherry::dataset::CaseIndex;
use ct_cherry::error::DataError;
use ct_cherry::metrics::{balanced_accuracy, dice_from_counts, roc_auc};
use ct_cherry::split::SplitAssignment;
use ct_cherry::VoiSpec;

use crate::batch::{VoiBatch, VoiBatcher, VoiDataset};
use crate::checkpoint::{BestCheckpoint, CheckpointManager};
use crate::error::{TrainError, TrainResult};
use crate::loss::task_loss;
use crate::network::TaskKind;

/// 实验目录下逐 epoch 指标文件的文件名 (JSON Lines).
pub const METRICS_FILE: &str = "metrics.jsonl";

/// 训练状态机的阶段.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    /// 构建模型与 dataloader, 审计输入.
    Initializing,

    /// 第 `epoch` 个训练 epoch 正在消费 batch 并更新权重.
    EpochRunning {
        /// 当前 epoch (从 0 计).
        epoch: usize,
    },

    /// 第 `epoch` 个 epoch 的验证集评估, 不更新权重.
    Validating {
        /// 当前 epoch.
        epoch: usize,
    },

    /// 第 `epoch` 个 epoch 的指标比较与可能的权重落盘.
    Checkpointing {
        /// 当前 epoch.
        epoch: usize,
    },

    /// 终态: 全部 epoch 正常完成.
    Completed,

    /// 终态: 出现不可恢复错误.
    Failed,
}

impl TrainPhase {
    /// 是否为终态. 终态不再接受任何迁移.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TrainPhase::Completed | TrainPhase::Failed)
    }

    /// `self -> next` 是否是合法迁移.
    pub fn may_advance(self, next: TrainPhase) -> bool {
        use TrainPhase::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Initializing, EpochRunning { epoch: 0 }) => true,
            (Initializing, Completed) => true,
            (EpochRunning { epoch: e }, Validating { epoch: v }) => e == v,
            (Validating { epoch: e }, Checkpointing { epoch: c }) => e == c,
            (Checkpointing { epoch: e }, EpochRunning { epoch: n }) => n == e + 1,
            (Checkpointing { .. }, Completed) => true,
            _ => false,
        }
    }
}

/// 把迁移规则封装成只能单向推进的状态件.
#[derive(Debug)]
pub struct TrainState {
    phase: TrainPhase,
}

impl Default for TrainState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainState {
    /// 从 `Initializing` 开始.
    pub fn new() -> TrainState {
        Self {
            phase: TrainPhase::Initializing,
        }
    }

    /// 当前阶段.
    #[inline]
    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    /// 请求迁移到 `next`.
    ///
    /// 非法迁移返回 [`TrainError::IllegalTransition`], 状态保持不变.
    pub fn advance(&mut self, next: TrainPhase) -> TrainResult<()> {
        if !self.phase.may_advance(next) {
            return Err(TrainError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        log::debug!("train phase {:?} -> {next:?}", self.phase);
        self.phase = next;
        Ok(())
    }

    /// 无条件进入 `Failed`. 已处于终态时什么也不做.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = TrainPhase::Failed;
        }
    }
}

/// 一个 epoch 的指标摘要, 即 [`METRICS_FILE`] 中的一行.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// epoch 序号 (从 0 计).
    pub epoch: usize,

    /// 训练集平均总损失.
    pub train_loss: f64,

    /// 验证集平均总损失.
    pub valid_loss: f64,

    /// 模型选择指标名 (dice / balanced_accuracy / auc).
    pub metric_name: String,

    /// 指标值. 验证集上无定义时 (如只有单一类别) 为 `None`.
    pub metric: Option<f64>,

    /// 本 epoch 是否刷新了最优指标并写出 checkpoint.
    pub improved: bool,
}

impl EpochMetrics {
    /// 追加写一行到指标文件.
    pub fn append_to(&self, path: &Path) -> TrainResult<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(self)?)?;
        Ok(())
    }

    /// 读回整个指标文件. 空行被忽略.
    pub fn load_history(path: &Path) -> TrainResult<Vec<EpochMetrics>> {
        let text = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }
}

/// [`run_training`] 的成功报告.
#[derive(Debug)]
pub struct TrainReport {
    /// 最终阶段. 成功路径上恒为 [`TrainPhase::Completed`].
    pub final_phase: TrainPhase,

    /// 实际跑完的 epoch 数.
    pub epochs_run: usize,

    /// 最优 checkpoint. 指标从未超过 0 时为 `None`.
    pub best: Option<BestCheckpoint>,

    /// 全部 epoch 的指标行, 与 [`METRICS_FILE`] 内容一致.
    pub history: Vec<EpochMetrics>,
}

/// 在给定划分上训练一个模型, 产物写入 `out_dir`.
///
/// 产物: `train-config.json`, `metrics.jsonl`,
/// `{task}-epoch{NNN}.mpk.gz` 若干与 `{task}-best.json`.
/// 失败时状态机进入 `Failed`, 错误原样返回, 已落盘的产物不回收.
pub fn run_training<B: AutodiffBackend>(
    config: &TrainConfig,
    index: &CaseIndex,
    split: &SplitAssignment,
    out_dir: &Path,
    device: &B::Device,
) -> TrainResult<TrainReport> {
    let mut state = TrainState::new();
    let result = train_loop::<B>(config, index, split, out_dir, device, &mut state);
    if let Err(err) = &result {
        let phase = state.phase();
        state.fail();
        log::error!("training failed during {phase:?}: {err}");
    }
    result
}

fn train_loop<B: AutodiffBackend>(
    config: &TrainConfig,
    index: &CaseIndex,
    split: &SplitAssignment,
    out_dir: &Path,
    device: &B::Device,
    state: &mut TrainState,
) -> TrainResult<TrainReport> {
    config.validate()?;
    config.save_to(out_dir)?;

    let task = config.network.task();
    log::info!(
        "experiment `{}`: task {}, {} epoch(s), batch size {}, {} train / {} valid case(s)",
        config.exp_id,
        task.name(),
        config.epochs,
        config.batch_size,
        split.train().len(),
        split.valid().len(),
    );

    if config.epochs == 0 {
        state.advance(TrainPhase::Completed)?;
        log::info!("0 epochs requested, nothing to train");
        return Ok(TrainReport {
            final_phase: state.phase(),
            epochs_run: 0,
            best: None,
            history: Vec::new(),
        });
    }

    if split.train().is_empty() {
        return Err(TrainError::EmptySplit("train"));
    }
    if split.valid().is_empty() {
        return Err(TrainError::EmptySplit("valid"));
    }
    audit_files(index, split)?;

    let mut model = config.network.init::<B>(device);
    let mut optim = AdamConfig::new().with_epsilon(1e-8).init();

    let train_set = VoiDataset::with_augment(
        split.train_records(index),
        VoiSpec::standard(),
        Augmenter::new(config.augment),
        config.seed,
    );
    let epoch_counter = train_set.epoch_handle();
    let train_loader = DataLoaderBuilder::new(VoiBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);

    let valid_set = VoiDataset::new(split.valid_records(index), VoiSpec::standard());
    let valid_loader = DataLoaderBuilder::new(VoiBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_set);

    let manager = CheckpointManager::new(out_dir, task);
    let metrics_path = out_dir.join(METRICS_FILE);
    let mut history = Vec::with_capacity(config.epochs);
    let mut best: Option<BestCheckpoint> = None;
    // 与指标同量纲的水位线; 三种选择指标都在 [0, 1] 且越大越好.
    let mut best_metric = 0.0f64;

    for epoch in 0..config.epochs {
        state.advance(TrainPhase::EpochRunning { epoch })?;
        epoch_counter.store(epoch as u64, Ordering::Relaxed);

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for batch in train_loader.iter() {
            let outputs = model.forward(batch.images.clone());
            let loss = task_loss(&outputs, &batch).ok_or(TrainError::HeadMismatch)?;
            loss_sum += loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }
        let train_loss = loss_sum / batches.max(1) as f64;

        state.advance(TrainPhase::Validating { epoch })?;
        let inner = model.valid();
        let (valid_loss, metric) = validate_epoch(&inner, valid_loader.as_ref(), task)?;

        state.advance(TrainPhase::Checkpointing { epoch })?;
        let improved = metric.map_or(false, |m| m > best_metric);
        if improved {
            let m = metric.unwrap();
            manager.save_epoch(&inner, epoch)?;
            best = Some(manager.record_best(epoch, m)?);
            best_metric = m;
        }

        let row = EpochMetrics {
            epoch,
            train_loss,
            valid_loss,
            metric_name: task.metric_name().to_owned(),
            metric,
            improved,
        };
        row.append_to(&metrics_path)?;
        log::info!(
            "epoch {}/{}: train loss {train_loss:.4}, valid loss {valid_loss:.4}, {} {}{}",
            epoch + 1,
            config.epochs,
            task.metric_name(),
            metric.map_or_else(|| "n/a".to_owned(), |m| format!("{m:.4}")),
            if improved { " (new best)" } else { "" },
        );
        history.push(row);
    }

    state.advance(TrainPhase::Completed)?;
    log::info!(
        "experiment `{}` completed, best {}: {}",
        config.exp_id,
        task.metric_name(),
        best.as_ref()
            .map_or_else(|| "none".to_owned(), |b| format!("{:.4} @ epoch {}", b.metric, b.epoch)),
    );
    Ok(TrainReport {
        final_phase: state.phase(),
        epochs_run: config.epochs,
        best,
        history,
    })
}

/// 开训前审计: 划分两侧引用的每个 case 都必须在索引中,
/// 且 image 与 mask 文件都在盘上.
fn audit_files(index: &CaseIndex, split: &SplitAssignment) -> TrainResult<()> {
    for id in split.train().iter().chain(split.valid().iter()) {
        let case = index
            .get(id)
            .ok_or_else(|| TrainError::UnknownCase(id.clone()))?;
        for path in [case.image_path(), case.mask_path()] {
            if !path.is_file() {
                return Err(DataError::MissingFile(path.to_owned()).into());
            }
        }
    }
    Ok(())
}

/// 验证集整趟评估: 返回 (平均损失, 选择指标).
fn validate_epoch<B: Backend>(
    model: &crate::network::NoduleModel<B>,
    loader: &dyn DataLoader<VoiBatch<B>>,
    task: TaskKind,
) -> TrainResult<(f64, Option<f64>)> {
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;

    let (mut inter, mut pred_fg, mut truth_fg) = (0usize, 0usize, 0usize);
    let mut type_preds: Vec<usize> = Vec::new();
    let mut type_truth: Vec<usize> = Vec::new();
    let mut malig_scores: Vec<f64> = Vec::new();
    let mut malig_truth: Vec<bool> = Vec::new();

    for batch in loader.iter() {
        let outputs = model.forward(batch.images.clone());
        if let Some(loss) = task_loss(&outputs, &batch) {
            loss_sum += loss.into_scalar().elem::<f64>();
            batches += 1;
        }

        match task {
            TaskKind::Segmentation => {
                let (logits, masks) = match (&outputs.mask_logits, &batch.masks) {
                    (Some(logits), Some(masks)) => (logits.clone(), masks.clone()),
                    _ => return Err(TrainError::HeadMismatch),
                };
                let probs: Vec<f32> = sigmoid(logits).into_data().iter::<f32>().collect();
                let truth: Vec<f32> = masks.into_data().iter::<f32>().collect();
                for (p, t) in probs.into_iter().zip(truth) {
                    let p = p >= 0.5;
                    let t = t >= 0.5;
                    inter += usize::from(p && t);
                    pred_fg += usize::from(p);
                    truth_fg += usize::from(t);
                }
            }
            TaskKind::NoduleType => {
                let logits = outputs.type_logits.ok_or(TrainError::HeadMismatch)?;
                let preds = logits.argmax(1).squeeze::<1>(1);
                type_preds.extend(preds.into_data().iter::<i32>().map(|v| v as usize));
                type_truth.extend(
                    batch
                        .type_targets
                        .clone()
                        .into_data()
                        .iter::<i32>()
                        .map(|v| v as usize),
                );
            }
            TaskKind::Malignancy => {
                let logits = outputs.malig_logits.ok_or(TrainError::HeadMismatch)?;
                malig_scores.extend(sigmoid(logits).into_data().iter::<f32>().map(f64::from));
                malig_truth.extend(
                    batch
                        .malig_targets
                        .clone()
                        .into_data()
                        .iter::<f32>()
                        .map(|v| v >= 0.5),
                );
            }
        }
    }

    let valid_loss = loss_sum / batches.max(1) as f64;
    let metric = match task {
        TaskKind::Segmentation => Some(dice_from_counts(inter, pred_fg, truth_fg)),
        TaskKind::NoduleType => balanced_accuracy(&type_preds, &type_truth, NUM_NODULE_TYPES),
        TaskKind::Malignancy => roc_auc(&malig_scores, &malig_truth),
    };
    if metric.is_none() {
        log::warn!(
            "validation metric `{}` undefined on this split",
            task.metric_name()
        );
    }
    Ok((valid_loss, metric))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkSpec, SegmentationSpec};

    type TB = burn::backend::Autodiff<burn::backend::NdArray>;

    fn phase_config(epochs: usize) -> TrainConfig {
        TrainConfig::new(
            "phase-test".into(),
            NetworkSpec::Segmentation(SegmentationSpec::standard()),
            epochs,
        )
    }

    #[test]
    fn test_phase_happy_path() {
        let mut state = TrainState::new();
        state.advance(TrainPhase::EpochRunning { epoch: 0 }).unwrap();
        state.advance(TrainPhase::Validating { epoch: 0 }).unwrap();
        state.advance(TrainPhase::Checkpointing { epoch: 0 }).unwrap();
        state.advance(TrainPhase::EpochRunning { epoch: 1 }).unwrap();
        state.advance(TrainPhase::Validating { epoch: 1 }).unwrap();
        state.advance(TrainPhase::Checkpointing { epoch: 1 }).unwrap();
        state.advance(TrainPhase::Completed).unwrap();
        assert!(state.phase().is_terminal());
    }

    #[test]
    fn test_phase_rejects_skips() {
        let mut state = TrainState::new();
        // 不能跳过验证.
        state.advance(TrainPhase::EpochRunning { epoch: 0 }).unwrap();
        let err = state
            .advance(TrainPhase::Checkpointing { epoch: 0 })
            .unwrap_err();
        assert!(matches!(err, TrainError::IllegalTransition { .. }));

        // epoch 序号必须逐一递增.
        let mut state = TrainState::new();
        state.advance(TrainPhase::EpochRunning { epoch: 0 }).unwrap();
        state.advance(TrainPhase::Validating { epoch: 0 }).unwrap();
        state.advance(TrainPhase::Checkpointing { epoch: 0 }).unwrap();
        assert!(state.advance(TrainPhase::EpochRunning { epoch: 3 }).is_err());

        // EpochRunning 不能直接完成.
        let mut state = TrainState::new();
        state.advance(TrainPhase::EpochRunning { epoch: 0 }).unwrap();
        assert!(state.advance(TrainPhase::Completed).is_err());

        // 首个 epoch 必须从 0 开始.
        let mut state = TrainState::new();
        assert!(state.advance(TrainPhase::EpochRunning { epoch: 1 }).is_err());
    }

    #[test]
    fn test_terminal_phases_absorb() {
        let mut state = TrainState::new();
        state.advance(TrainPhase::Completed).unwrap();
        assert!(state.advance(TrainPhase::EpochRunning { epoch: 0 }).is_err());
        assert!(state.advance(TrainPhase::Failed).is_err());

        let mut state = TrainState::new();
        state.fail();
        assert_eq!(state.phase(), TrainPhase::Failed);
        state.fail();
        assert_eq!(state.phase(), TrainPhase::Failed);
        assert!(state.advance(TrainPhase::Completed).is_err());
    }

    #[test]
    fn test_any_active_phase_may_fail() {
        for target in [
            TrainPhase::Initializing,
            TrainPhase::EpochRunning { epoch: 2 },
            TrainPhase::Validating { epoch: 2 },
            TrainPhase::Checkpointing { epoch: 2 },
        ] {
            assert!(target.may_advance(TrainPhase::Failed));
        }
        assert!(!TrainPhase::Completed.may_advance(TrainPhase::Failed));
    }

    #[test]
    fn test_zero_epochs_completes_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        // 空 labels 表: 0 epoch 路径不读任何数据.
        let index = empty_index(dir.path());
        let split = empty_split(dir.path());

        let report = run_training::<TB>(
            &phase_config(0),
            &index,
            &split,
            &dir.path().join("out"),
            &device,
        )
        .unwrap();

        assert_eq!(report.final_phase, TrainPhase::Completed);
        assert_eq!(report.epochs_run, 0);
        assert!(report.best.is_none());
        assert!(report.history.is_empty());
        // 配置持久化了, 但没有任何 checkpoint 文件.
        let out = dir.path().join("out");
        assert!(out.join(TRAIN_CONFIG_FILE).is_file());
        assert!(!out.join(METRICS_FILE).exists());
        assert!(std::fs::read_dir(&out)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".mpk.gz")));
    }

    #[test]
    fn test_empty_split_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let index = empty_index(dir.path());
        let split = empty_split(dir.path());

        let err = run_training::<TB>(
            &phase_config(1),
            &index,
            &split,
            &dir.path().join("out"),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::EmptySplit("train")));
    }

    #[test]
    fn test_metrics_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METRICS_FILE);
        for epoch in 0..3 {
            EpochMetrics {
                epoch,
                train_loss: 0.5 - epoch as f64 * 0.1,
                valid_loss: 0.6 - epoch as f64 * 0.1,
                metric_name: "dice".into(),
                metric: if epoch == 1 { None } else { Some(0.7) },
                improved: epoch == 0,
            }
            .append_to(&path)
            .unwrap();
        }

        let rows = EpochMetrics::load_history(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].epoch, 2);
        assert!(rows[1].metric.is_none());
        assert!(rows[0].improved);
    }

    fn empty_index(dir: &Path) -> CaseIndex {
        let labels = dir.join("labels.csv");
        std::fs::write(&labels, "caseid,noduletype,malignancy,image,mask\n").unwrap();
        CaseIndex::from_labels(&labels, dir).unwrap()
    }

    fn empty_split(dir: &Path) -> SplitAssignment {
        let train = dir.join("train.csv");
        let valid = dir.join("valid.csv");
        std::fs::write(&train, "caseid\n").unwrap();
        std::fs::write(&valid, "caseid\n").unwrap();
        SplitAssignment::load(&train, &valid).unwrap()
    }
}
