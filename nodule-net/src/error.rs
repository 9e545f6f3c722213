//! 训练/推理侧运行时错误.

use thiserror::Error;

use crate::trainer::TrainPhase;
use ct_cherry::error::{ConfigError, DataError};

/// 模型权重读写错误.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// burn recorder 序列化/反序列化失败.
    #[error("recorder error: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    /// 尚未记录过最优 checkpoint.
    #[error("no best checkpoint recorded yet")]
    MissingBest,

    /// 元数据 JSON 解析失败.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 训练过程错误.
#[derive(Debug, Error)]
pub enum TrainError {
    /// 状态机收到一次非法迁移请求.
    #[error("illegal phase transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// 当前阶段.
        from: TrainPhase,

        /// 被拒绝的目标阶段.
        to: TrainPhase,
    },

    /// 划分的某一侧为空.
    #[error("split side `{0}` holds no cases")]
    EmptySplit(&'static str),

    /// 划分引用了 labels 表中不存在的 case.
    #[error("split references unknown case `{0}`")]
    UnknownCase(String),

    /// 网络输出与任务所需的头不匹配.
    #[error("network outputs carry no head for the configured task")]
    HeadMismatch,

    /// 训练配置非法.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 配置文件读写失败.
    #[error("config file error: {0}")]
    ConfigFile(#[from] burn::config::ConfigError),

    /// 数据读取失败 (含开训前审计发现的缺失文件).
    #[error(transparent)]
    Data(#[from] DataError),

    /// checkpoint 读写失败.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// 指标行序列化失败.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 推理与分析错误.
#[derive(Debug, Error)]
pub enum InferError {
    /// 实验目录下持久化训练配置的读取或校验失败.
    #[error("experiment config error: {0}")]
    Config(#[from] TrainError),

    /// 数据读取失败.
    #[error(transparent)]
    Data(#[from] DataError),

    /// checkpoint 读写失败.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// 网络没有产出该任务的输出头.
    #[error("network produced no `{0}` output")]
    MissingHead(&'static str),

    /// Grad-CAM 只支持卷积分类网络.
    #[error("grad-cam needs a convolutional classification network")]
    CamUnsupported,

    /// 反向传播没有把梯度带到特征图上.
    #[error("no gradient reached the feature maps")]
    NoGradient,

    /// 预测表写出失败.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 调用外部工具 (nnU-Net) 的错误.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    /// 进程无法启动 (典型原因: 可执行文件不存在).
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        /// 目标可执行文件.
        program: String,

        /// 启动失败的底层原因.
        #[source]
        source: std::io::Error,
    },

    /// 进程以非零状态退出.
    #[error("`{program}` exited with status {code:?}: {stderr}")]
    NonZeroExit {
        /// 目标可执行文件.
        program: String,

        /// 退出码. 被信号终止时为 `None`.
        code: Option<i32>,

        /// stderr 尾部片段.
        stderr: String,
    },

    /// 目录脚手架创建失败.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// checkpoint 操作的结果类型.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// 训练操作的结果类型.
pub type TrainResult<T> = Result<T, TrainError>;

/// 推理操作的结果类型.
pub type InferResult<T> = Result<T, InferError>;

/// 外部工具调用的结果类型.
pub type ToolResult<T> = Result<T, ExternalToolError>;
