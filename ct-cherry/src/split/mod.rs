//! 数据集划分.
//!
//! 以 patient 为最小单位做分层 train/valid 划分: 同一 patient
//! 的全部结节永远落在同一侧. 分层键为 (结节类型, 恶性程度),
//! 逐 stratum 按最大余数法分配验证名额, 保证每类的验证 case
//! 数与全局比例的偏差不超过 1.
//!
//! 相同 (索引, 参数) 下划分结果逐字节可复现.

mod folds;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::consts::{Malignancy, NoduleType};
use crate::dataset::{CaseIndex, CaseRecord};
use crate::error::{ConfigError, ConfigResult, SplitError, SplitResult};

pub use folds::{make_folds, FoldSet};

/// 划分策略.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SplitStrategy {
    /// 仅分层划分.
    Stratified,

    /// 分层划分后, 训练侧将少数 stratum 的 case 重复采样到与最大
    /// stratum 等量. 验证侧永远不会被重复采样.
    OversampleMinority,
}

/// 划分参数. 经 [`SplitSpec::new`] 校验后不可变.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SplitSpec {
    valid_fraction: f64,
    seed: u64,
    strategy: SplitStrategy,
}

impl SplitSpec {
    /// 构建并校验划分参数. `valid_fraction` 必须在开区间 (0, 1).
    pub fn new(valid_fraction: f64, seed: u64, strategy: SplitStrategy) -> ConfigResult<SplitSpec> {
        if !(valid_fraction.is_finite() && 0.0 < valid_fraction && valid_fraction < 1.0) {
            return Err(ConfigError::out_of_range(
                "valid_fraction",
                format!("must be in (0, 1), got {valid_fraction}"),
            ));
        }
        Ok(Self {
            valid_fraction,
            seed,
            strategy,
        })
    }

    /// 验证集占比.
    #[inline]
    pub fn valid_fraction(&self) -> f64 {
        self.valid_fraction
    }

    /// 随机种子.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// 划分策略.
    #[inline]
    pub fn strategy(&self) -> SplitStrategy {
        self.strategy
    }
}

/// 一次划分的结果: train/valid 两侧的 case id 列表.
///
/// 采用 `OversampleMinority` 策略时, `train` 是多重集合
/// (少数类 case id 会出现多次); `valid` 永远没有重复.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitAssignment {
    train: Vec<String>,
    valid: Vec<String>,
}

impl SplitAssignment {
    pub(crate) fn from_parts(train: Vec<String>, valid: Vec<String>) -> Self {
        Self { train, valid }
    }

    /// 训练侧 case id 列表 (可能含重复).
    #[inline]
    pub fn train(&self) -> &[String] {
        &self.train
    }

    /// 验证侧 case id 列表.
    #[inline]
    pub fn valid(&self) -> &[String] {
        &self.valid
    }

    /// 训练侧与验证侧是否 (集合意义上) 不相交.
    pub fn is_disjoint(&self) -> bool {
        let valid: HashSet<&str> = self.valid.iter().map(String::as_str).collect();
        self.train.iter().all(|id| !valid.contains(id.as_str()))
    }

    /// 按划分顺序收集训练侧的 case 记录, 重复 id 产生重复记录.
    ///
    /// `index` 中不存在的 id 会被静默跳过.
    pub fn train_records(&self, index: &CaseIndex) -> Vec<CaseRecord> {
        self.train
            .iter()
            .filter_map(|id| index.get(id).cloned())
            .collect()
    }

    /// 按划分顺序收集验证侧的 case 记录.
    ///
    /// `index` 中不存在的 id 会被静默跳过.
    pub fn valid_records(&self, index: &CaseIndex) -> Vec<CaseRecord> {
        self.valid
            .iter()
            .filter_map(|id| index.get(id).cloned())
            .collect()
    }

    /// 将两侧分别保存为单列 CSV (`train.csv` / `valid.csv` 模式的文件对).
    pub fn save(&self, train_path: &Path, valid_path: &Path) -> SplitResult<()> {
        save_ids(&self.train, train_path)?;
        save_ids(&self.valid, valid_path)?;
        Ok(())
    }

    /// 从一对单列 CSV 读回划分.
    pub fn load(train_path: &Path, valid_path: &Path) -> SplitResult<SplitAssignment> {
        Ok(Self {
            train: load_ids(train_path)?,
            valid: load_ids(valid_path)?,
        })
    }
}

fn save_ids(ids: &[String], path: &Path) -> SplitResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["caseid"])?;
    for id in ids {
        writer.write_record([id.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

fn load_ids(path: &Path) -> SplitResult<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut ids = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(id) = row.get(0) {
            ids.push(id.to_owned());
        }
    }
    Ok(ids)
}

/// stratum 键: (结节类型编码, 恶性程度编码).
type Stratum = (usize, usize);

/// 一个 patient 及其全部 case.
struct PatientGroup {
    stratum: Stratum,
    case_ids: Vec<String>,
}

/// 把索引按 patient 聚合. patient 的 stratum 取其首个 case 的标签.
///
/// 返回值按 patient id 排序, 使划分与 labels 表的行序无关.
fn patient_groups(index: &CaseIndex) -> SplitResult<Vec<PatientGroup>> {
    if index.is_empty() {
        return Err(SplitError::EmptyIndex);
    }

    let mut groups: BTreeMap<String, PatientGroup> = BTreeMap::new();
    for case in index.iter() {
        let entry = groups
            .entry(case.patient_id().to_owned())
            .or_insert_with(|| PatientGroup {
                stratum: (case.nodule_type().index(), case.malignancy().index()),
                case_ids: Vec::new(),
            });
        entry.case_ids.push(case.case_id().to_owned());
    }
    Ok(groups.into_values().collect())
}

/// stratum 的人类可读描述, 用于错误信息.
fn describe_stratum((t, m): Stratum) -> String {
    let ty = NoduleType::from_index(t).map(|t| t.name()).unwrap_or("?");
    let malig = match Malignancy::from_index(m) {
        Some(Malignancy::Malignant) => "malignant",
        _ => "benign",
    };
    format!("{ty}/{malig}")
}

/// 构建一次分层 train/valid 划分.
///
/// 任一 stratum 的 patient 数少于 2 时返回
/// [`SplitError::InsufficientData`] (两个分区各需至少分得 1 个的可能性).
pub fn build_split(index: &CaseIndex, spec: &SplitSpec) -> SplitResult<SplitAssignment> {
    let groups = patient_groups(index)?;
    let total = groups.len();

    // stratum -> 该层的 group 下标.
    let mut by_stratum: BTreeMap<Stratum, Vec<usize>> = BTreeMap::new();
    for (i, g) in groups.iter().enumerate() {
        by_stratum.entry(g.stratum).or_default().push(i);
    }
    for (stratum, members) in &by_stratum {
        if members.len() < 2 {
            return Err(SplitError::InsufficientData {
                stratum: describe_stratum(*stratum),
                cases: members.len(),
                need: 2,
            });
        }
    }

    // 最大余数法分配验证名额.
    let target = (total as f64 * spec.valid_fraction).round() as usize;
    let mut quotas: Vec<(Stratum, usize, f64)> = by_stratum
        .iter()
        .map(|(s, members)| {
            let exact = members.len() as f64 * spec.valid_fraction;
            (*s, exact.floor() as usize, exact - exact.floor())
        })
        .collect();
    let assigned: usize = quotas.iter().map(|q| q.1).sum();
    let mut leftover = target.saturating_sub(assigned);

    // 余数大者优先; 余数相同时按 stratum 键序. BTreeMap 迭代已按键序,
    // 稳定排序保持该性质.
    let mut by_frac: Vec<usize> = (0..quotas.len()).collect();
    by_frac.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(quotas[i].2)));
    for i in by_frac {
        if leftover == 0 {
            break;
        }
        quotas[i].1 += 1;
        leftover -= 1;
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut train_groups: Vec<usize> = Vec::new();
    let mut valid_groups: Vec<usize> = Vec::new();
    for (stratum, quota, _) in &quotas {
        let mut members = by_stratum[stratum].clone();
        members.shuffle(&mut rng);
        // quota 不会超过层大小: exact < size, 至多 +1, 且层大小 >= 2.
        let quota = (*quota).min(members.len() - 1);
        valid_groups.extend(members.drain(..quota));
        train_groups.extend(members);
    }
    train_groups.sort_unstable();
    valid_groups.sort_unstable();

    let expand = |idxs: &[usize]| -> Vec<String> {
        idxs.iter()
            .flat_map(|&i| groups[i].case_ids.iter().cloned())
            .collect()
    };
    let mut train = expand(&train_groups);
    let valid = expand(&valid_groups);

    if spec.strategy == SplitStrategy::OversampleMinority {
        oversample(&mut train, index, &mut rng);
    }

    Ok(SplitAssignment { train, valid })
}

/// 把训练侧各 stratum 重复采样到与最大 stratum 等量.
fn oversample(train: &mut Vec<String>, index: &CaseIndex, rng: &mut StdRng) {
    let mut by_stratum: BTreeMap<Stratum, Vec<String>> = BTreeMap::new();
    for id in train.iter() {
        if let Some(case) = index.get(id) {
            by_stratum
                .entry((case.nodule_type().index(), case.malignancy().index()))
                .or_default()
                .push(id.clone());
        }
    }
    let largest = by_stratum.values().map(Vec::len).max().unwrap_or(0);

    for members in by_stratum.values() {
        for _ in members.len()..largest {
            let pick = members[rng.gen_range(0..members.len())].clone();
            train.push(pick);
        }
    }
}
