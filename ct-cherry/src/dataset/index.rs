//! labels 表索引.
//!
//! LUNA23 数据集以一张 labels 表描述全部结节: 每行一个 case, 给出
//! 结节类型、恶性程度、image/mask 文件相对路径和可选的体素中心.
//! 本模块将其解析为内存索引, 并在解析期完成全部 schema 校验,
//! 保证下游模块拿到的记录总是良构的.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::consts::{Malignancy, NoduleType, NUM_NODULE_TYPES};
use crate::error::{IndexError, IndexResult};
use crate::Idx3d;

/// labels 表的必需列.
const REQUIRED_COLUMNS: [&str; 5] = ["caseid", "noduletype", "malignancy", "image", "mask"];

/// labels 表的可选列: patient id 与标注中心体素坐标.
const COL_PATIENT: &str = "patientid";
const COL_VOXEL_Z: &str = "voxel_z";
const COL_VOXEL_Y: &str = "voxel_y";
const COL_VOXEL_X: &str = "voxel_x";

/// labels 表中的一行: 一个结节 case 的全部元信息.
///
/// 解析完成后不可变.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaseRecord {
    case_id: String,
    patient_id: String,
    nodule_type: NoduleType,
    malignancy: Malignancy,
    image: PathBuf,
    mask: PathBuf,
    center: Option<Idx3d>,
}

impl CaseRecord {
    /// case id.
    #[inline]
    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// patient id. labels 表没有 `patientid` 列时等于 case id.
    #[inline]
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// 结节类型标签.
    #[inline]
    pub fn nodule_type(&self) -> NoduleType {
        self.nodule_type
    }

    /// 恶性程度标签.
    #[inline]
    pub fn malignancy(&self) -> Malignancy {
        self.malignancy
    }

    /// image 文件全路径.
    #[inline]
    pub fn image_path(&self) -> &Path {
        &self.image
    }

    /// mask 文件全路径.
    #[inline]
    pub fn mask_path(&self) -> &Path {
        &self.mask
    }

    /// 标注中心体素坐标, 按 `(z, H, W)` 排列. 表中未给出时为 `None`.
    #[inline]
    pub fn center(&self) -> Option<Idx3d> {
        self.center
    }
}

/// 整张 labels 表的内存索引.
#[derive(Debug, Clone)]
pub struct CaseIndex {
    root: PathBuf,
    cases: Vec<CaseRecord>,
}

impl CaseIndex {
    /// 打开 `root` 下按 LUNA23 模式组织的数据集: labels 表位于
    /// `{root}/labels.csv`, image/mask 路径相对于 `root` 解析.
    pub fn open<P: AsRef<Path>>(root: P) -> IndexResult<CaseIndex> {
        let root = root.as_ref();
        Self::from_labels(root.join("labels.csv"), root)
    }

    /// 从指定的 labels 表文件构建索引. `root` 为 image/mask
    /// 相对路径的解析根.
    ///
    /// 必需列缺失时返回 [`IndexError::MissingColumn`];
    /// 标签值无法解析时返回 [`IndexError::BadLabel`];
    /// case id 重复时返回 [`IndexError::DuplicateCase`].
    pub fn from_labels<P: AsRef<Path>, Q: AsRef<Path>>(
        labels: P,
        root: Q,
    ) -> IndexResult<CaseIndex> {
        let root = root.as_ref().to_owned();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(labels.as_ref())?;

        let headers = reader.headers()?.clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        for required in REQUIRED_COLUMNS {
            if col(required).is_none() {
                return Err(IndexError::MissingColumn(required));
            }
        }
        let idx_case = col("caseid").unwrap();
        let idx_type = col("noduletype").unwrap();
        let idx_malig = col("malignancy").unwrap();
        let idx_image = col("image").unwrap();
        let idx_mask = col("mask").unwrap();
        let idx_patient = col(COL_PATIENT);
        let idx_center = match (col(COL_VOXEL_Z), col(COL_VOXEL_Y), col(COL_VOXEL_X)) {
            (Some(z), Some(y), Some(x)) => Some((z, y, x)),
            (None, None, None) => None,
            // 三列要么都有, 要么都没有.
            _ => return Err(IndexError::MissingColumn("voxel_{z,y,x}")),
        };

        let mut seen = HashSet::new();
        let mut cases = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |idx: usize| row.get(idx).unwrap_or("");

            let case_id = field(idx_case).to_owned();
            if case_id.is_empty() {
                return Err(IndexError::BadLabel {
                    case: format!("<row {}>", cases.len() + 1),
                    detail: "empty case id".into(),
                });
            }
            if !seen.insert(case_id.clone()) {
                return Err(IndexError::DuplicateCase(case_id));
            }

            let nodule_type = parse_nodule_type(field(idx_type)).ok_or_else(|| {
                IndexError::BadLabel {
                    case: case_id.clone(),
                    detail: format!("unknown nodule type `{}`", field(idx_type)),
                }
            })?;
            let malignancy = parse_malignancy(field(idx_malig)).ok_or_else(|| {
                IndexError::BadLabel {
                    case: case_id.clone(),
                    detail: format!("bad malignancy `{}`", field(idx_malig)),
                }
            })?;

            let image = field(idx_image);
            let mask = field(idx_mask);
            if image.is_empty() || mask.is_empty() {
                return Err(IndexError::BadLabel {
                    case: case_id,
                    detail: "empty image/mask path".into(),
                });
            }

            let patient_id = idx_patient
                .map(|i| field(i).to_owned())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| case_id.clone());

            let center = match idx_center {
                Some((iz, iy, ix)) => {
                    Some(parse_center(field(iz), field(iy), field(ix)).ok_or_else(|| {
                        IndexError::BadLabel {
                            case: case_id.clone(),
                            detail: "bad voxel center".into(),
                        }
                    })?)
                }
                None => None,
            };

            cases.push(CaseRecord {
                case_id,
                patient_id,
                nodule_type,
                malignancy,
                image: root.join(image),
                mask: root.join(mask),
                center,
            });
        }

        Ok(CaseIndex { root, cases })
    }

    /// 数据集根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// case 总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// 索引是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// 按表序迭代全部 case.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &CaseRecord> {
        self.cases.iter()
    }

    /// 全部 case 记录.
    #[inline]
    pub fn cases(&self) -> &[CaseRecord] {
        &self.cases
    }

    /// 按 case id 查找记录.
    pub fn get(&self, case_id: &str) -> Option<&CaseRecord> {
        self.cases.iter().find(|c| c.case_id == case_id)
    }

    /// 收集 image 或 mask 文件缺失的 (case, 缺失路径) 列表.
    ///
    /// 单个 case 两个文件都缺失时会产生两个条目.
    pub fn missing_files(&self) -> Vec<(&CaseRecord, PathBuf)> {
        let mut ans = Vec::new();
        for case in &self.cases {
            for path in [&case.image, &case.mask] {
                if !path.is_file() {
                    ans.push((case, path.clone()));
                }
            }
        }
        ans
    }

    /// 各结节类型的 case 数, 下标即类型编码.
    pub fn type_histogram(&self) -> [usize; NUM_NODULE_TYPES] {
        let mut ans = [0; NUM_NODULE_TYPES];
        for case in &self.cases {
            ans[case.nodule_type.index()] += 1;
        }
        ans
    }

    /// 恶性 case 数.
    #[inline]
    pub fn malignant_count(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| c.malignancy.is_malignant())
            .count()
    }
}

/// 解析结节类型: 接受整数编码或名称/别名.
fn parse_nodule_type(s: &str) -> Option<NoduleType> {
    if let Ok(idx) = s.parse::<usize>() {
        return NoduleType::from_index(idx);
    }
    NoduleType::from_name(s)
}

/// 解析恶性程度: 接受 0/1 或 Benign/Malignant.
fn parse_malignancy(s: &str) -> Option<Malignancy> {
    match s {
        "0" | "Benign" => Some(Malignancy::Benign),
        "1" | "Malignant" => Some(Malignancy::Malignant),
        _ => None,
    }
}

/// 解析标注中心. 三个分量都必须是非负整数.
fn parse_center(z: &str, y: &str, x: &str) -> Option<Idx3d> {
    Some((
        z.parse::<usize>().ok()?,
        y.parse::<usize>().ok()?,
        x.parse::<usize>().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const FULL_TABLE: &str = "\
caseid,patientid,noduletype,malignancy,image,mask,voxel_z,voxel_y,voxel_x
n0001,p01,Solid,1,image/n0001.nii.gz,mask/n0001.nii.gz,30,128,140
n0002,p01,GroundGlass,0,image/n0002.nii.gz,mask/n0002.nii.gz,41,99,87
n0003,p02,2,0,image/n0003.nii.gz,mask/n0003.nii.gz,12,64,64
n0004,p03,Mixed,1,image/n0004.nii.gz,mask/n0004.nii.gz,55,100,101
";

    fn write_labels(content: &str) -> (tempfile::TempDir, CaseIndex) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("labels.csv"), content).unwrap();
        let index = CaseIndex::open(dir.path()).unwrap();
        (dir, index)
    }

    #[test]
    fn test_parse_full_table() {
        let (_dir, index) = write_labels(FULL_TABLE);
        assert_eq!(index.len(), 4);

        let first = index.get("n0001").unwrap();
        assert_eq!(first.patient_id(), "p01");
        assert_eq!(first.nodule_type(), NoduleType::Solid);
        assert_eq!(first.malignancy(), Malignancy::Malignant);
        assert_eq!(first.center(), Some((30, 128, 140)));
        assert!(first.image_path().ends_with("image/n0001.nii.gz"));

        // 整数编码与别名都可解析.
        assert_eq!(index.get("n0003").unwrap().nodule_type(), NoduleType::Solid);
        assert_eq!(
            index.get("n0004").unwrap().nodule_type(),
            NoduleType::PartSolid
        );
    }

    #[test]
    fn test_histograms() {
        let (_dir, index) = write_labels(FULL_TABLE);
        assert_eq!(index.type_histogram(), [1, 1, 2, 0]);
        assert_eq!(index.malignant_count(), 2);
    }

    #[test]
    fn test_missing_required_column() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("labels.csv"),
            "caseid,noduletype,image,mask\nn0001,Solid,a.nii.gz,b.nii.gz\n",
        )
        .unwrap();
        let err = CaseIndex::open(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::MissingColumn("malignancy")));
    }

    #[test]
    fn test_patient_defaults_to_case() {
        let (_dir, index) = write_labels(
            "caseid,noduletype,malignancy,image,mask\nn0001,Solid,1,a.nii.gz,b.nii.gz\n",
        );
        assert_eq!(index.get("n0001").unwrap().patient_id(), "n0001");
        assert_eq!(index.get("n0001").unwrap().center(), None);
    }

    #[test]
    fn test_bad_label_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("labels.csv"),
            "caseid,noduletype,malignancy,image,mask\nn0001,Spiky,1,a.nii.gz,b.nii.gz\n",
        )
        .unwrap();
        assert!(matches!(
            CaseIndex::open(dir.path()).unwrap_err(),
            IndexError::BadLabel { .. }
        ));

        fs::write(
            dir.path().join("labels.csv"),
            "caseid,noduletype,malignancy,image,mask\n\
             n0001,Solid,1,a.nii.gz,b.nii.gz\nn0001,Solid,0,c.nii.gz,d.nii.gz\n",
        )
        .unwrap();
        assert!(matches!(
            CaseIndex::open(dir.path()).unwrap_err(),
            IndexError::DuplicateCase(id) if id == "n0001"
        ));
    }

    #[test]
    fn test_missing_files_audit() {
        let (dir, index) = write_labels(FULL_TABLE);
        // 所有文件都不存在: 每个 case 记两条.
        assert_eq!(index.missing_files().len(), 8);

        fs::create_dir_all(dir.path().join("image")).unwrap();
        fs::create_dir_all(dir.path().join("mask")).unwrap();
        fs::write(dir.path().join("image/n0001.nii.gz"), b"x").unwrap();
        fs::write(dir.path().join("mask/n0001.nii.gz"), b"x").unwrap();
        let index = CaseIndex::open(dir.path()).unwrap();
        assert_eq!(index.missing_files().len(), 6);
    }
}
