//! K 折交叉验证划分与磁盘固化.
//!
//! 折按恶性程度在 patient 级别分层: 每个 stratum 的 patient 洗牌后
//! 轮转发牌到各折. 第 `k` 折以该折的 patient 为验证侧, 其余为训练侧.
//!
//! 折文件固化为 `train{k}.csv` / `valid{k}.csv` (k 从 0 起), 已存在
//! 的文件不会被重新生成, 以保证跨次实验使用同一套划分.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::consts::Malignancy;
use crate::dataset::CaseIndex;
use crate::error::{ConfigError, SplitError, SplitResult};

use super::{patient_groups, SplitAssignment};

/// 一组交叉验证折.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSet {
    folds: Vec<SplitAssignment>,
}

impl FoldSet {
    /// 折数.
    #[inline]
    pub fn len(&self) -> usize {
        self.folds.len()
    }

    /// 是否不含任何折.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    /// 第 `k` 折的划分. `k` 越界时 panic.
    #[inline]
    pub fn fold(&self, k: usize) -> &SplitAssignment {
        &self.folds[k]
    }

    /// 按折序迭代.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &SplitAssignment> {
        self.folds.iter()
    }

    /// 第 `k` 折的一对文件路径 `(train{k}.csv, valid{k}.csv)`.
    pub fn fold_paths(dir: &Path, k: usize) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("train{k}.csv")),
            dir.join(format!("valid{k}.csv")),
        )
    }

    /// 把所有折写入 `dir`. 目录不存在时自动创建.
    pub fn save(&self, dir: &Path) -> SplitResult<()> {
        std::fs::create_dir_all(dir)?;
        for (k, fold) in self.folds.iter().enumerate() {
            let (train_path, valid_path) = Self::fold_paths(dir, k);
            fold.save(&train_path, &valid_path)?;
        }
        Ok(())
    }

    /// 从 `dir` 读回 `n_folds` 折.
    pub fn load(dir: &Path, n_folds: usize) -> SplitResult<FoldSet> {
        let mut folds = Vec::with_capacity(n_folds);
        for k in 0..n_folds {
            let (train_path, valid_path) = Self::fold_paths(dir, k);
            folds.push(SplitAssignment::load(&train_path, &valid_path)?);
        }
        Ok(FoldSet { folds })
    }

    /// `dir` 下 `n_folds` 折的文件是否齐全.
    pub fn files_present(dir: &Path, n_folds: usize) -> bool {
        (0..n_folds).all(|k| {
            let (train_path, valid_path) = Self::fold_paths(dir, k);
            train_path.is_file() && valid_path.is_file()
        })
    }

    /// 读取已固化的折; 文件不全时重新生成并写盘.
    ///
    /// 已存在的折文件优先于 `seed`: 只要文件齐全, 传入的种子不参与
    /// 任何计算.
    pub fn load_or_create(
        index: &CaseIndex,
        dir: &Path,
        n_folds: usize,
        seed: u64,
    ) -> SplitResult<FoldSet> {
        if Self::files_present(dir, n_folds) {
            return Self::load(dir, n_folds);
        }
        let folds = make_folds(index, n_folds, seed)?;
        folds.save(dir)?;
        Ok(folds)
    }
}

/// 构建 `n_folds` 折分层交叉验证划分.
///
/// `n_folds` 必须不小于 2; 任一恶性程度 stratum 的 patient 数少于
/// `n_folds` 时返回 [`SplitError::InsufficientData`].
pub fn make_folds(index: &CaseIndex, n_folds: usize, seed: u64) -> SplitResult<FoldSet> {
    if n_folds < 2 {
        return Err(ConfigError::out_of_range(
            "n_folds",
            format!("must be >= 2, got {n_folds}"),
        )
        .into());
    }
    let groups = patient_groups(index)?;

    // 仅按恶性程度分层.
    let mut by_malig: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, g) in groups.iter().enumerate() {
        by_malig.entry(g.stratum.1).or_default().push(i);
    }
    for (&malig, members) in &by_malig {
        if members.len() < n_folds {
            let label = match Malignancy::from_index(malig) {
                Some(Malignancy::Malignant) => "malignant",
                _ => "benign",
            };
            return Err(SplitError::InsufficientData {
                stratum: label.to_owned(),
                cases: members.len(),
                need: n_folds,
            });
        }
    }

    // 每个 stratum 洗牌后轮转发牌.
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fold_members: Vec<Vec<usize>> = vec![Vec::new(); n_folds];
    for members in by_malig.values() {
        let mut members = members.clone();
        members.shuffle(&mut rng);
        for (i, g) in members.into_iter().enumerate() {
            fold_members[i % n_folds].push(g);
        }
    }

    let expand = |idxs: &[usize]| -> Vec<String> {
        let mut idxs = idxs.to_vec();
        idxs.sort_unstable();
        idxs.iter()
            .flat_map(|&i| groups[i].case_ids.iter().cloned())
            .collect()
    };

    let folds = (0..n_folds)
        .map(|k| {
            let valid = expand(&fold_members[k]);
            let train_groups: Vec<usize> = (0..n_folds)
                .filter(|&j| j != k)
                .flat_map(|j| fold_members[j].iter().copied())
                .collect();
            SplitAssignment::from_parts(expand(&train_groups), valid)
        })
        .collect();
    Ok(FoldSet { folds })
}
