//! 模型权重与最优记录的持久化.
//!
//! 每个入选 epoch 的权重以 burn `NamedMpkGzFileRecorder` 落盘, 文件名形如
//! `malignancy-epoch007.mpk.gz`; 最优 epoch 的元数据单独记在
//! `{task}-best.json`, 推理端据此重建模型并恢复权重.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{HalfPrecisionSettings, NamedMpkGzFileRecorder, Recorder};
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, CheckpointResult};
use crate::network::{NetworkSpec, NoduleModel, TaskKind};

/// 最优 checkpoint 的元数据.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    /// 取得最优指标的 epoch (从 0 计).
    pub epoch: usize,

    /// 当时的模型选择指标值.
    pub metric: f64,

    /// 对应权重文件的文件名 (含扩展名).
    pub file: String,
}

/// 单个任务在单个实验目录下的 checkpoint 管理器.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    task: TaskKind,
}

impl CheckpointManager {
    /// 绑定实验目录与任务. 目录在首次写入时创建.
    pub fn new(dir: impl Into<PathBuf>, task: TaskKind) -> CheckpointManager {
        Self {
            dir: dir.into(),
            task,
        }
    }

    /// 实验目录.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem_name(&self, epoch: usize) -> String {
        format!("{}-epoch{:03}", self.task.name(), epoch)
    }

    /// 某 epoch 权重文件的路径前缀. recorder 负责追加 `.mpk.gz`.
    pub fn epoch_stem(&self, epoch: usize) -> PathBuf {
        self.dir.join(self.stem_name(epoch))
    }

    /// 最优元数据文件 `{task}-best.json` 的路径.
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}-best.json", self.task.name()))
    }

    /// 落盘一个 epoch 的全部权重.
    pub fn save_epoch<B: Backend>(
        &self,
        model: &NoduleModel<B>,
        epoch: usize,
    ) -> CheckpointResult<()> {
        fs::create_dir_all(&self.dir)?;
        NamedMpkGzFileRecorder::<HalfPrecisionSettings>::new()
            .record(model.clone().into_record(), self.epoch_stem(epoch))?;
        Ok(())
    }

    /// 按参数重建模型并载入指定 epoch 的权重.
    pub fn load_epoch<B: Backend>(
        &self,
        spec: &NetworkSpec,
        epoch: usize,
        device: &B::Device,
    ) -> CheckpointResult<NoduleModel<B>> {
        let record =
            NamedMpkGzFileRecorder::<HalfPrecisionSettings>::new().load(self.epoch_stem(epoch), device)?;
        Ok(spec.init::<B>(device).load_record(record))
    }

    /// 把某 epoch 标记为当前最优, 覆盖写 `{task}-best.json`.
    pub fn record_best(&self, epoch: usize, metric: f64) -> CheckpointResult<BestCheckpoint> {
        fs::create_dir_all(&self.dir)?;
        let best = BestCheckpoint {
            epoch,
            metric,
            file: format!("{}.mpk.gz", self.stem_name(epoch)),
        };
        fs::write(self.best_path(), serde_json::to_string_pretty(&best)?)?;
        Ok(best)
    }

    /// 读取最优记录. 从未记录过时返回 `Ok(None)`.
    pub fn best(&self) -> CheckpointResult<Option<BestCheckpoint>> {
        let path = self.best_path();
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// 重建模型并载入最优权重.
    ///
    /// 没有最优记录时返回 [`CheckpointError::MissingBest`].
    pub fn load_best<B: Backend>(
        &self,
        spec: &NetworkSpec,
        device: &B::Device,
    ) -> CheckpointResult<(NoduleModel<B>, BestCheckpoint)> {
        let best = self.best()?.ok_or(CheckpointError::MissingBest)?;
        let model = self.load_epoch(spec, best.epoch, device)?;
        Ok((model, best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ClassificationSpec, TaskKind};

    type TB = burn::backend::NdArray;

    fn tiny_spec() -> NetworkSpec {
        NetworkSpec::Classification(
            ClassificationSpec::new(TaskKind::Malignancy, 2, 0.0).unwrap(),
        )
    }

    fn malig_logit(model: &NoduleModel<TB>, device: &<TB as Backend>::Device) -> f64 {
        let images = Tensor::<TB, 5>::ones([1, 1, 16, 16, 16], device);
        model
            .forward(images)
            .malig_logits
            .expect("malignancy head")
            .into_scalar()
            .elem::<f64>()
    }

    #[test]
    fn test_save_load_roundtrip_preserves_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let manager = CheckpointManager::new(dir.path(), TaskKind::Malignancy);

        let spec = tiny_spec();
        let model: NoduleModel<TB> = spec.init(&device);
        manager.save_epoch(&model, 7).unwrap();
        assert!(dir.path().join("malignancy-epoch007.mpk.gz").is_file());

        let restored = manager.load_epoch::<TB>(&spec, 7, &device).unwrap();
        let a = malig_logit(&model, &device);
        let b = malig_logit(&restored, &device);
        assert!((a - b).abs() < 1e-6, "{a} vs {b}");
    }

    #[test]
    fn test_best_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), TaskKind::NoduleType);
        assert!(manager.best().unwrap().is_none());

        let best = manager.record_best(3, 0.85).unwrap();
        assert_eq!(best.file, "noduletype-epoch003.mpk.gz");

        let read = manager.best().unwrap().expect("best recorded");
        assert_eq!(read, best);

        // 覆盖写.
        manager.record_best(5, 0.9).unwrap();
        assert_eq!(manager.best().unwrap().unwrap().epoch, 5);
    }

    #[test]
    fn test_load_best_without_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let manager = CheckpointManager::new(dir.path(), TaskKind::Malignancy);

        let err = manager
            .load_best::<TB>(&tiny_spec(), &device)
            .err()
            .expect("must fail");
        assert!(matches!(err, CheckpointError::MissingBest));
    }
}
