//! LUNA23 CT image/mask 数据加载器.
//!
//! 提供迭代器风格的数据集获取模式. 加载器在创建时拿走 case 记录的
//! 所有权, 迭代时逐个打开文件; 打开失败不会中断迭代,
//! 错误作为条目的一部分返回.

use std::path::Path;

use super::index::CaseRecord;
use crate::data::{VoiSample, VoiSpec, VolumePair};
use crate::error::DataResult;
use crate::ScanVolume;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 从给定 case 记录创建 (image, mask) 对的加载器.
///
/// # 注意
///
/// 记录中的文件缺失或无法解码时, 加载器在迭代到该 case
/// 时返回 `Result::Err`, 不影响后续 case.
pub fn pair_loader<I: IntoIterator<Item = CaseRecord>>(cases: I) -> PairLoader {
    let mut cases: Vec<CaseRecord> = cases.into_iter().collect();
    cases.reverse();
    PairLoader { cases_rev: cases }
}

/// 3D CT (image, mask) 数据加载器.
#[derive(Debug)]
pub struct PairLoader {
    cases_rev: Vec<CaseRecord>,
}

impl Iterator for PairLoader {
    type Item = (CaseRecord, DataResult<VolumePair>);

    fn next(&mut self) -> Option<Self::Item> {
        let case = self.cases_rev.pop()?;
        let pair = VolumePair::open(case.image_path(), case.mask_path());
        Some((case, pair))
    }
}

impl ExactSizeIterator for PairLoader {
    #[inline]
    fn len(&self) -> usize {
        self.cases_rev.len()
    }
}

/// 从给定 case 记录创建 VOI 样本加载器. 每个样本按 `spec`
/// 提取并归一化, 中心取 labels 表的标注中心 (缺省时回退到 mask 质心).
pub fn voi_loader<I: IntoIterator<Item = CaseRecord>>(cases: I, spec: VoiSpec) -> VoiLoader {
    let mut cases: Vec<CaseRecord> = cases.into_iter().collect();
    cases.reverse();
    VoiLoader {
        cases_rev: cases,
        spec,
        require_mask: true,
    }
}

/// 与 [`voi_loader`] 相同, 但不读取 mask 文件, 样本的 `mask` 为 `None`.
/// 用于推理阶段没有标注的 case.
pub fn voi_loader_unmasked<I: IntoIterator<Item = CaseRecord>>(
    cases: I,
    spec: VoiSpec,
) -> VoiLoader {
    let mut cases: Vec<CaseRecord> = cases.into_iter().collect();
    cases.reverse();
    VoiLoader {
        cases_rev: cases,
        spec,
        require_mask: false,
    }
}

/// VOI 样本加载器.
#[derive(Debug)]
pub struct VoiLoader {
    cases_rev: Vec<CaseRecord>,
    spec: VoiSpec,
    require_mask: bool,
}

impl VoiLoader {
    /// 提取参数.
    #[inline]
    pub fn spec(&self) -> VoiSpec {
        self.spec
    }
}

/// 加载单个 case 的 VOI.
fn load_voi(case: &CaseRecord, spec: VoiSpec, require_mask: bool) -> DataResult<VoiSample> {
    if require_mask {
        let pair = VolumePair::open(case.image_path(), case.mask_path())?;
        Ok(spec.extract(&pair, case.center()))
    } else {
        let scan = ScanVolume::open(case.image_path())?;
        Ok(spec.extract_unmasked(&scan, case.center()))
    }
}

impl Iterator for VoiLoader {
    type Item = (CaseRecord, DataResult<VoiSample>);

    fn next(&mut self) -> Option<Self::Item> {
        let case = self.cases_rev.pop()?;
        let sample = load_voi(&case, self.spec, self.require_mask);
        Some((case, sample))
    }
}

impl ExactSizeIterator for VoiLoader {
    #[inline]
    fn len(&self) -> usize {
        self.cases_rev.len()
    }
}

/// 并发操作部分.
#[cfg(feature = "rayon")]
pub mod par {
    use super::*;

    /// 借助 `rayon`, 并行加载全部 case 的 VOI 样本. 返回顺序与输入一致.
    pub fn load_vois<I: IntoIterator<Item = CaseRecord>>(
        cases: I,
        spec: VoiSpec,
    ) -> Vec<(CaseRecord, DataResult<VoiSample>)> {
        let cases: Vec<CaseRecord> = cases.into_iter().collect();
        cases
            .into_par_iter()
            .map(|case| {
                let sample = load_voi(&case, spec, true);
                (case, sample)
            })
            .collect()
    }

    /// 借助 `rayon`, 并行加载全部 case 的无标注 VOI 样本. 返回顺序与输入一致.
    pub fn load_vois_unmasked<I: IntoIterator<Item = CaseRecord>>(
        cases: I,
        spec: VoiSpec,
    ) -> Vec<(CaseRecord, DataResult<VoiSample>)> {
        let cases: Vec<CaseRecord> = cases.into_iter().collect();
        cases
            .into_par_iter()
            .map(|case| {
                let sample = load_voi(&case, spec, false);
                (case, sample)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CaseIndex;
    use crate::error::DataError;
    use std::fs;

    fn fabricated_index() -> (tempfile::TempDir, CaseIndex) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("labels.csv"),
            "caseid,noduletype,malignancy,image,mask\n\
             n0001,Solid,1,image/n0001.nii.gz,mask/n0001.nii.gz\n\
             n0002,Solid,0,image/n0002.nii.gz,mask/n0002.nii.gz\n",
        )
        .unwrap();
        let index = CaseIndex::open(dir.path()).unwrap();
        (dir, index)
    }

    #[test]
    fn test_loader_len_decreases() {
        let (_dir, index) = fabricated_index();
        let mut loader = pair_loader(index.cases().to_vec());
        assert_eq!(loader.len(), 2);

        let (case, result) = loader.next().unwrap();
        assert_eq!(case.case_id(), "n0001");
        assert!(result.is_err());
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn test_missing_mask_before_any_read() {
        let (dir, index) = fabricated_index();
        // image 存在而 mask 缺失: 必须在读取 image 之前报 MissingFile(mask).
        fs::create_dir_all(dir.path().join("image")).unwrap();
        fs::write(dir.path().join("image/n0001.nii.gz"), b"not-a-nifti").unwrap();

        let case = index.get("n0001").unwrap().clone();
        let mask_path = case.mask_path().to_owned();
        let (_, result) = voi_loader([case], VoiSpec::standard()).next().unwrap();
        match result {
            Err(DataError::MissingFile(p)) => assert_eq!(p, mask_path),
            other => panic!("expected MissingFile, got {other:?}"),
        }
    }

    #[test]
    fn test_unmasked_loader_skips_mask() {
        let (_dir, index) = fabricated_index();
        let case = index.get("n0002").unwrap().clone();
        let image_path = case.image_path().to_owned();
        let (_, result) = voi_loader_unmasked([case], VoiSpec::standard())
            .next()
            .unwrap();
        // mask 不被读取, 错误只会来自 image.
        match result {
            Err(DataError::MissingFile(p)) => assert_eq!(p, image_path),
            other => panic!("expected MissingFile, got {other:?}"),
        }
    }
}
