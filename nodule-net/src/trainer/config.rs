//! 训练配置.

use std::path::Path;

use burn::prelude::*;

use ct_cherry::augment::AugmentSpec;
use ct_cherry::error::{ConfigError, ConfigResult};

use crate::error::TrainResult;
use crate::network::NetworkSpec;

/// 实验目录下配置文件的文件名.
pub const TRAIN_CONFIG_FILE: &str = "train-config.json";

/// 一次训练运行的全部参数.
///
/// 开训前随实验目录持久化为 [`TRAIN_CONFIG_FILE`],
/// 推理端读取同一份文件重建模型.
#[derive(Config, Debug)]
pub struct TrainConfig {
    /// 实验标识, 结果目录名的组成部分.
    pub exp_id: String,

    /// 网络构建参数.
    pub network: NetworkSpec,

    /// 训练总 epoch 数. 0 表示初始化后直接完成, 不写任何 checkpoint.
    pub epochs: usize,

    /// 每个 batch 的样本数.
    #[config(default = "4")]
    pub batch_size: usize,

    /// Adam 学习率.
    #[config(default = "1e-4")]
    pub learning_rate: f64,

    /// 实验随机种子, 决定 shuffle 顺序与增广抽样.
    #[config(default = "2023")]
    pub seed: u64,

    /// dataloader 工作线程数.
    #[config(default = "1")]
    pub num_workers: usize,

    /// 训练侧增广参数. 验证侧恒不增广.
    #[config(default = "AugmentSpec::light()")]
    pub augment: AugmentSpec,
}

impl TrainConfig {
    /// 校验全部字段.
    ///
    /// 反序列化得到的实例在进入训练前必须通过该校验.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.exp_id.trim().is_empty() {
            return Err(ConfigError::Empty("exp_id"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::out_of_range("batch_size", "must be >= 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::out_of_range(
                "learning_rate",
                format!("must be finite and positive, got {}", self.learning_rate),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::out_of_range("num_workers", "must be >= 1"));
        }
        self.network.validate()?;
        self.augment.validate()
    }

    /// 把配置写到实验目录下的 [`TRAIN_CONFIG_FILE`].
    pub fn save_to(&self, dir: &Path) -> TrainResult<()> {
        std::fs::create_dir_all(dir)?;
        self.save(dir.join(TRAIN_CONFIG_FILE))?;
        Ok(())
    }

    /// 从实验目录读取配置并校验.
    pub fn load_from(dir: &Path) -> TrainResult<TrainConfig> {
        let config = <TrainConfig as Config>::load(dir.join(TRAIN_CONFIG_FILE))?;
        config.validate()?;
        Ok(config)
    }
}
