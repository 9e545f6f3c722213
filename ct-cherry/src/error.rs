//! 运行时错误.

use std::path::PathBuf;

use thiserror::Error;

use crate::Idx3d;

/// 读取 3D CT 数据时的运行时错误.
#[derive(Debug, Error)]
pub enum DataError {
    /// image 或 mask 文件在读取前就不存在.
    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    /// image 与 mask 的体素形状不一致.
    #[error("shape mismatch: image {image:?} vs mask {mask:?}")]
    ShapeMismatch {
        /// image 的 `(z, H, W)` 形状.
        image: Idx3d,

        /// mask 的 `(z, H, W)` 形状.
        mask: Idx3d,
    },

    /// nii 文件解码失败.
    #[error("nifti decode failed: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// npy 文件写出失败.
    #[error("npy write failed: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    /// npy 文件读取失败.
    #[error("npy read failed: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 解析 labels 表时的运行时错误.
#[derive(Debug, Error)]
pub enum IndexError {
    /// 必需列缺失.
    #[error("labels table misses required column `{0}`")]
    MissingColumn(&'static str),

    /// 某一行的标签值无法解析.
    #[error("bad label for case `{case}`: {detail}")]
    BadLabel {
        /// 出错行的 case id.
        case: String,

        /// 具体原因.
        detail: String,
    },

    /// 同一 case id 出现了多次.
    #[error("duplicate case id `{0}`")]
    DuplicateCase(String),

    /// CSV 解析错误.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 参数校验错误. 所有带数值域约束的配置结构共用该类型.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 字段取值超出其文档规定的范围.
    #[error("field `{field}` out of range: {detail}")]
    OutOfRange {
        /// 字段名.
        field: &'static str,

        /// 具体原因.
        detail: String,
    },

    /// 配置要求的集合为空.
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
}

impl ConfigError {
    /// 构建一个 [`ConfigError::OutOfRange`].
    #[inline]
    pub fn out_of_range(field: &'static str, detail: impl Into<String>) -> ConfigError {
        ConfigError::OutOfRange {
            field,
            detail: detail.into(),
        }
    }
}

/// 数据集划分时的运行时错误.
#[derive(Debug, Error)]
pub enum SplitError {
    /// 某一 stratum 的样本数不足以完成要求的划分.
    #[error("insufficient data in stratum `{stratum}`: {cases} case(s), need >= {need}")]
    InsufficientData {
        /// stratum 的描述 (如 "noduletype=Solid/malignancy=1").
        stratum: String,

        /// 该 stratum 实际拥有的 case 数.
        cases: usize,

        /// 完成划分所需的最少 case 数.
        need: usize,
    },

    /// 输入索引为空.
    #[error("case index is empty")]
    EmptyIndex,

    /// 划分参数非法.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 划分文件读写时的 CSV 错误.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// 底层 IO 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 读数据操作的结果类型.
pub type DataResult<T> = Result<T, DataError>;

/// 索引操作的结果类型.
pub type IndexResult<T> = Result<T, IndexError>;

/// 参数校验的结果类型.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// 划分操作的结果类型.
pub type SplitResult<T> = Result<T, SplitError>;
