//! VOI (volume of interest) 提取.
//!
//! 以结节为中心, 从完整 CT 体数据中切出固定形状的子体.
//! 中心的确定顺序: 标注中心 -> mask 前景质心 -> 体数据几何中心.
//! 越界部分用窗下限 (image) / 背景 (mask) 填充, 因此对任意合法输入,
//! 输出形状恒等于目标形状.

use std::ops::Range;
use std::path::Path;

use ndarray::{s, Array3};

use super::{HuWindow, MaskVolume, NiftiMeta, ScanVolume, VolumePair};
use crate::consts::VOI_SHAPE;
use crate::error::{ConfigError, ConfigResult, DataError, DataResult};
use crate::Idx3d;

/// VOI 提取参数. 包含目标形状和 HU 归一化窗口.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoiSpec {
    shape: Idx3d,
    window: HuWindow,
}

impl Default for VoiSpec {
    #[inline]
    fn default() -> Self {
        Self::standard()
    }
}

impl VoiSpec {
    /// 构建 VOI 提取参数. `shape` 按 `(z, H, W)` 排列.
    ///
    /// `shape` 任一维为 0 时返回 [`ConfigError::OutOfRange`].
    pub fn new(shape: Idx3d, window: HuWindow) -> ConfigResult<VoiSpec> {
        let (z, h, w) = shape;
        if z == 0 || h == 0 || w == 0 {
            return Err(ConfigError::out_of_range(
                "shape",
                format!("all dims must be positive, got {shape:?}"),
            ));
        }
        Ok(Self { shape, window })
    }

    /// 标准提取参数: 形状 [`VOI_SHAPE`], 窗口 \[-1000, 400\] HU.
    #[inline]
    pub const fn standard() -> VoiSpec {
        Self {
            shape: VOI_SHAPE,
            window: HuWindow::from_nodule_visual(),
        }
    }

    /// 目标形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// HU 归一化窗口.
    #[inline]
    pub fn window(&self) -> HuWindow {
        self.window
    }

    /// 从 (扫描, 标注) 对中提取 VOI.
    ///
    /// `center` 为 labels 表给出的标注中心; 缺省时回退到 mask
    /// 前景质心, mask 全背景时再回退到体数据几何中心.
    pub fn extract(&self, pair: &VolumePair, center: Option<Idx3d>) -> VoiSample {
        let center = center
            .or_else(|| pair.mask.centroid())
            .unwrap_or_else(|| volume_center(pair.scan.shape()));
        VoiSample {
            image: self.crop_scan(&pair.scan, center),
            mask: Some(self.crop_mask(&pair.mask, center)),
        }
    }

    /// 从无标注的扫描中提取 VOI. 用于推理阶段没有 mask 文件的 case.
    ///
    /// `center` 缺省时使用体数据几何中心.
    pub fn extract_unmasked(&self, scan: &ScanVolume, center: Option<Idx3d>) -> VoiSample {
        let center = center.unwrap_or_else(|| volume_center(scan.shape()));
        VoiSample {
            image: self.crop_scan(scan, center),
            mask: None,
        }
    }

    /// 裁剪扫描并做窗口归一化. 填充值为窗下限, 归一化后即 0.0.
    fn crop_scan(&self, scan: &ScanVolume, center: Idx3d) -> Array3<f32> {
        let mut out = Array3::<f32>::from_elem(self.shape, self.window.lower_bound());
        let (src, dst) = crop_ranges(scan.shape(), self.shape, center);
        if ranges_nonempty(&src) {
            out.slice_mut(s![
                dst[0].clone(),
                dst[1].clone(),
                dst[2].clone()
            ])
            .assign(&scan.data().slice(s![
                src[0].clone(),
                src[1].clone(),
                src[2].clone()
            ]));
        }
        self.window.normalize_volume(out.view_mut());
        out
    }

    /// 裁剪标注. 填充值为背景.
    fn crop_mask(&self, mask: &MaskVolume, center: Idx3d) -> Array3<u8> {
        let mut out = Array3::<u8>::zeros(self.shape);
        let (src, dst) = crop_ranges(mask.shape(), self.shape, center);
        if ranges_nonempty(&src) {
            out.slice_mut(s![
                dst[0].clone(),
                dst[1].clone(),
                dst[2].clone()
            ])
            .assign(&mask.data().slice(s![
                src[0].clone(),
                src[1].clone(),
                src[2].clone()
            ]));
        }
        out
    }
}

/// 体数据几何中心.
#[inline]
fn volume_center((z, h, w): Idx3d) -> Idx3d {
    (z / 2, h / 2, w / 2)
}

/// 单轴上的裁剪区间: 返回 (源区间, 目标区间). 两区间长度相等.
fn axis_ranges(len: usize, target: usize, center: usize) -> (Range<usize>, Range<usize>) {
    let lo = center as isize - (target / 2) as isize;
    let src_start = lo.max(0) as usize;
    let src_end = (lo + target as isize).clamp(0, len as isize) as usize;
    let src_start = src_start.min(src_end);

    let dst_start = (src_start as isize - lo) as usize;
    let dst_end = dst_start + (src_end - src_start);
    (src_start..src_end, dst_start..dst_end)
}

/// 三轴裁剪区间.
fn crop_ranges(
    len: Idx3d,
    target: Idx3d,
    center: Idx3d,
) -> ([Range<usize>; 3], [Range<usize>; 3]) {
    let (sz, dz) = axis_ranges(len.0, target.0, center.0);
    let (sh, dh) = axis_ranges(len.1, target.1, center.1);
    let (sw, dw) = axis_ranges(len.2, target.2, center.2);
    ([sz, sh, sw], [dz, dh, dw])
}

#[inline]
fn ranges_nonempty(ranges: &[Range<usize>; 3]) -> bool {
    ranges.iter().all(|r| !r.is_empty())
}

/// 提取后的 VOI 样本. image 已窗口归一化到 `[0, 1]`.
///
/// 推理阶段没有标注的 case, `mask` 为 `None`.
#[derive(Debug, Clone)]
pub struct VoiSample {
    /// 归一化后的 CT 子体, 形状为提取参数的目标形状.
    pub image: Array3<f32>,

    /// 二值标注子体, 与 `image` 形状一致.
    pub mask: Option<Array3<u8>>,
}

impl VoiSample {
    /// 样本形状, 按 `(z, H, W)` 排列.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let sh = self.image.shape();
        (sh[0], sh[1], sh[2])
    }

    /// 是否携带标注.
    #[inline]
    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// 标注中前景体素个数. 无标注时为 0.
    pub fn foreground_count(&self) -> usize {
        self.mask
            .as_ref()
            .map(|m| m.iter().filter(|p| **p > 0).count())
            .unwrap_or(0)
    }

    /// 将样本保存为 `{stem}-image.npy` (和 `{stem}-mask.npy`, 若有标注).
    pub fn save_npy(&self, dir: &Path, stem: &str) -> DataResult<()> {
        ndarray_npy::write_npy(dir.join(format!("{stem}-image.npy")), &self.image)?;
        if let Some(mask) = &self.mask {
            ndarray_npy::write_npy(dir.join(format!("{stem}-mask.npy")), mask)?;
        }
        Ok(())
    }

    /// 从 `{stem}-image.npy` (和 `{stem}-mask.npy`, 若存在) 读回样本.
    ///
    /// image 文件不存在时返回 [`DataError::MissingFile`].
    pub fn load_npy(dir: &Path, stem: &str) -> DataResult<VoiSample> {
        let image_path = dir.join(format!("{stem}-image.npy"));
        if !image_path.is_file() {
            return Err(DataError::MissingFile(image_path));
        }
        let image: Array3<f32> = ndarray_npy::read_npy(image_path)?;

        let mask_path = dir.join(format!("{stem}-mask.npy"));
        let mask = if mask_path.is_file() {
            Some(ndarray_npy::read_npy(mask_path)?)
        } else {
            None
        };
        Ok(VoiSample { image, mask })
    }
}
