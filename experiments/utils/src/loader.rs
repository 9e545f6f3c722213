//! 对 `ct-cherry::dataset` 的更一层封装. 提供更直接的数据集定位与索引加载.

use ct_cherry::dataset::{self, CaseIndex};
use ct_cherry::error::IndexResult;
use std::env;
use std::path::{Path, PathBuf};

/// 获取 LUNA23 数据集根目录.
///
/// 1. 若环境变量 `$LUNA_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/luna23`.
pub fn data_dir_from_env_or_home() -> PathBuf {
    if let Ok(d) = env::var("LUNA_DATA_DIR") {
        PathBuf::from(d)
    } else {
        dataset::home_luna23_dir().unwrap()
    }
}

/// 获取实验结果根目录. 划分文件、checkpoint 与推理输出都写到这里.
///
/// 1. 若环境变量 `$LUNA_RESULTS_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/luna23/results`.
pub fn results_dir_from_env_or_home() -> PathBuf {
    if let Ok(d) = env::var("LUNA_RESULTS_DIR") {
        PathBuf::from(d)
    } else {
        dataset::home_dataset_dir_with(["luna23", "results"]).unwrap()
    }
}

/// 从给定数据集根目录读取 case 索引.
pub fn index_from<P: AsRef<Path>>(root: P) -> IndexResult<CaseIndex> {
    CaseIndex::open(root)
}

/// 从 `$LUNA_DATA_DIR` 或者 `$HOME/dataset/luna23` 下读取 case 索引.
#[inline]
pub fn index_from_env_or_home() -> IndexResult<CaseIndex> {
    index_from(data_dir_from_env_or_home())
}
