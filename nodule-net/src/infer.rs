//! 用训练产物做推理.
//!
//! [`run_inference`] 从实验目录读回 [`TrainConfig`], 按其网络参数
//! 重建模型并载入最优 checkpoint, 再逐 case 提取 VOI (恒不增广)
//! 前向. 分割任务把二值化掩膜写成 `masks/{caseid}.npy`;
//! 分类任务把各类概率与预测编码写进 [`PREDICTIONS_FILE`].
//! 推理阶段允许 case 没有 mask 文件, 此时分割结果无 Dice 可报.

use std::fs;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use either::Either;
use ndarray::Array3;

use ct_cherry::consts::NoduleType;
use ct_cherry::dataset::CaseRecord;
use ct_cherry::error::DataError;
use ct_cherry::metrics::dice_coefficient;
use ct_cherry::{ScanVolume, VoiSample, VoiSpec, VolumePair};

use crate::checkpoint::CheckpointManager;
use crate::error::{InferError, InferResult};
use crate::network::{NoduleModel, TaskKind};
use crate::trainer::TrainConfig;

/// 推理输出目录下分类得分表的文件名.
pub const PREDICTIONS_FILE: &str = "predictions.csv";

/// 推理输出目录下分割掩膜子目录的名称.
pub const MASKS_DIR: &str = "masks";

/// 分割推理的单 case 摘要. 完整掩膜在 `masks/{caseid}.npy`.
#[derive(Debug, Clone)]
pub struct MaskPrediction {
    /// case id.
    pub case_id: String,

    /// 预测掩膜的前景体素数.
    pub foreground: usize,

    /// 与标注的 Dice 系数. 该 case 没有 mask 文件时为 `None`.
    pub dice: Option<f64>,
}

/// 分类推理的单 case 结果.
#[derive(Debug, Clone)]
pub struct ScorePrediction {
    /// case id.
    pub case_id: String,

    /// 各类别概率. 结节类型任务按编码序 4 个, 恶性任务单个.
    pub scores: Vec<f64>,

    /// 预测类别编码.
    pub predicted: usize,
}

/// 在 `cases` 上运行 `exp_dir` 里训练出的最优模型.
///
/// 分割任务返回 `Left`, 分类任务返回 `Right`; 两侧的向量都与
/// `cases` 顺序一致. 磁盘产物写入 `out_dir`, 失败时已写出的
/// 部分不回收.
pub fn run_inference<B: Backend>(
    exp_dir: &Path,
    cases: &[CaseRecord],
    out_dir: &Path,
    device: &B::Device,
) -> InferResult<Either<Vec<MaskPrediction>, Vec<ScorePrediction>>> {
    let config = TrainConfig::load_from(exp_dir)?;
    let task = config.network.task();

    let manager = CheckpointManager::new(exp_dir, task);
    let (model, best) = manager.load_best::<B>(&config.network, device)?;
    log::info!(
        "inference over {} case(s): task {}, weights from epoch {} ({} {:.4})",
        cases.len(),
        task.name(),
        best.epoch,
        task.metric_name(),
        best.metric,
    );

    fs::create_dir_all(out_dir)?;
    match task {
        TaskKind::Segmentation => {
            infer_masks(&model, cases, out_dir, device).map(Either::Left)
        }
        TaskKind::NoduleType | TaskKind::Malignancy => {
            infer_scores(&model, task, cases, out_dir, device).map(Either::Right)
        }
    }
}

/// 不增广地读取并裁剪一个 case. 没有 mask 文件时退化为纯扫描提取.
fn load_sample(case: &CaseRecord) -> InferResult<VoiSample> {
    let spec = VoiSpec::standard();
    if case.mask_path().is_file() {
        let pair = VolumePair::open(case.image_path(), case.mask_path())?;
        Ok(spec.extract(&pair, case.center()))
    } else {
        let scan = ScanVolume::open(case.image_path())?;
        Ok(spec.extract_unmasked(&scan, case.center()))
    }
}

/// 单个样本的 `[1, 1, z, H, W]` 输入张量.
pub(crate) fn sample_tensor<B: Backend>(sample: &VoiSample, device: &B::Device) -> Tensor<B, 5> {
    let (z, h, w) = sample.shape();
    let flat: Vec<f32> = sample.image.iter().copied().collect();
    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([1, 1, z, h, w])
}

fn infer_masks<B: Backend>(
    model: &NoduleModel<B>,
    cases: &[CaseRecord],
    out_dir: &Path,
    device: &B::Device,
) -> InferResult<Vec<MaskPrediction>> {
    let masks_dir = out_dir.join(MASKS_DIR);
    fs::create_dir_all(&masks_dir)?;

    let mut results = Vec::with_capacity(cases.len());
    for case in cases {
        let sample = load_sample(case)?;
        let (z, h, w) = sample.shape();

        let outputs = model.forward(sample_tensor(&sample, device));
        let logits = outputs
            .mask_logits
            .ok_or(InferError::MissingHead("segmentation"))?;
        let bits: Vec<u8> = sigmoid(logits)
            .into_data()
            .iter::<f32>()
            .map(|p| u8::from(p >= 0.5))
            .collect();
        // 长度与形状由前向输出的形状保证一致.
        let pred = Array3::from_shape_vec((z, h, w), bits).unwrap();

        ndarray_npy::write_npy(
            masks_dir.join(format!("{}.npy", case.case_id())),
            &pred,
        )
        .map_err(DataError::from)?;

        let dice = sample
            .mask
            .as_ref()
            .map(|truth| dice_coefficient(pred.view(), truth.view()));
        let foreground = pred.iter().filter(|&&v| v > 0).count();
        log::debug!(
            "case `{}`: {foreground} foreground voxel(s), dice {dice:?}",
            case.case_id()
        );
        results.push(MaskPrediction {
            case_id: case.case_id().to_owned(),
            foreground,
            dice,
        });
    }

    let labeled: Vec<f64> = results.iter().filter_map(|p| p.dice).collect();
    if !labeled.is_empty() {
        log::info!(
            "mean dice over {} labeled case(s): {:.4}",
            labeled.len(),
            labeled.iter().sum::<f64>() / labeled.len() as f64,
        );
    }
    Ok(results)
}

fn infer_scores<B: Backend>(
    model: &NoduleModel<B>,
    task: TaskKind,
    cases: &[CaseRecord],
    out_dir: &Path,
    device: &B::Device,
) -> InferResult<Vec<ScorePrediction>> {
    let mut writer = csv::Writer::from_path(out_dir.join(PREDICTIONS_FILE))?;
    match task {
        TaskKind::NoduleType => {
            let mut header = vec!["caseid".to_owned()];
            header.extend(NoduleType::ALL.iter().map(|t| t.name().to_lowercase()));
            header.push("predicted".to_owned());
            writer.write_record(&header)?;
        }
        TaskKind::Malignancy => {
            writer.write_record(["caseid", "malignant", "predicted"])?;
        }
        TaskKind::Segmentation => unreachable!("score path never sees segmentation"),
    }

    let mut results = Vec::with_capacity(cases.len());
    for case in cases {
        let sample = load_sample(case)?;
        let outputs = model.forward(sample_tensor(&sample, device));

        let (scores, predicted) = match task {
            TaskKind::NoduleType => {
                let logits = outputs
                    .type_logits
                    .ok_or(InferError::MissingHead("noduletype"))?;
                let scores: Vec<f64> = softmax(logits, 1)
                    .into_data()
                    .iter::<f32>()
                    .map(f64::from)
                    .collect();
                let predicted = scores
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                (scores, predicted)
            }
            TaskKind::Malignancy => {
                let logits = outputs
                    .malig_logits
                    .ok_or(InferError::MissingHead("malignancy"))?;
                let score = sigmoid(logits).into_scalar().elem::<f64>();
                (vec![score], usize::from(score >= 0.5))
            }
            TaskKind::Segmentation => unreachable!(),
        };

        let mut row = vec![case.case_id().to_owned()];
        row.extend(scores.iter().map(|s| format!("{s:.6}")));
        row.push(match task {
            // argmax 落在 `0..NUM_NODULE_TYPES` 内, from_index 不会失败.
            TaskKind::NoduleType => NoduleType::from_index(predicted).unwrap().name().to_owned(),
            _ => predicted.to_string(),
        });
        writer.write_record(&row)?;

        results.push(ScorePrediction {
            case_id: case.case_id().to_owned(),
            scores,
            predicted,
        });
    }
    writer.flush()?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::error::CheckpointError;
    use crate::network::{ClassificationSpec, NetworkSpec, SegmentationSpec};
    use crate::trainer::TrainConfig;

    type TB = burn::backend::NdArray;

    fn write_config(dir: &Path, network: NetworkSpec) -> TrainConfig {
        let config = TrainConfig::new("infer-test".into(), network, 1);
        config.save_to(dir).unwrap();
        config
    }

    #[test]
    fn test_missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let err = run_inference::<TB>(dir.path(), &[], dir.path(), &device).unwrap_err();
        assert!(matches!(err, InferError::Config(_)));
    }

    #[test]
    fn test_missing_best_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        write_config(
            dir.path(),
            NetworkSpec::Classification(
                ClassificationSpec::new(TaskKind::Malignancy, 2, 0.0).unwrap(),
            ),
        );

        let err = run_inference::<TB>(dir.path(), &[], dir.path(), &device).unwrap_err();
        assert!(matches!(
            err,
            InferError::Checkpoint(CheckpointError::MissingBest)
        ));
    }

    #[test]
    fn test_classification_writes_header_only_table() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = write_config(
            dir.path(),
            NetworkSpec::Classification(
                ClassificationSpec::new(TaskKind::NoduleType, 2, 0.0).unwrap(),
            ),
        );

        let manager = CheckpointManager::new(dir.path(), TaskKind::NoduleType);
        let model: NoduleModel<TB> = config.network.init(&device);
        manager.save_epoch(&model, 0).unwrap();
        manager.record_best(0, 0.5).unwrap();

        let out = dir.path().join("out");
        let result = run_inference::<TB>(dir.path(), &[], &out, &device).unwrap();
        assert!(result.right().expect("classification side").is_empty());

        let table = std::fs::read_to_string(out.join(PREDICTIONS_FILE)).unwrap();
        assert_eq!(
            table.trim(),
            "caseid,groundglass,partsolid,solid,calcified,predicted"
        );
    }

    #[test]
    fn test_segmentation_scaffolds_masks_dir() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = write_config(
            dir.path(),
            NetworkSpec::Segmentation(SegmentationSpec::new(2).unwrap()),
        );

        let manager = CheckpointManager::new(dir.path(), TaskKind::Segmentation);
        let model: NoduleModel<TB> = config.network.init(&device);
        manager.save_epoch(&model, 0).unwrap();
        manager.record_best(0, 0.4).unwrap();

        let out = dir.path().join("out");
        let result = run_inference::<TB>(dir.path(), &[], &out, &device).unwrap();
        assert!(result.left().expect("segmentation side").is_empty());
        assert!(out.join(MASKS_DIR).is_dir());
        assert!(!out.join(PREDICTIONS_FILE).exists());
    }
}
