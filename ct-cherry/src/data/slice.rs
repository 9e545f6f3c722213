//! 二维水平切片视图与其持久化存储.

use std::ops::Index;
use std::path::Path;

use image::{ImageResult, Luma, Rgb};
use ndarray::iter::Iter;
use ndarray::{ArrayView2, Ix2};

use crate::consts::gray::*;
use crate::{HuWindow, Idx2d};

/// 不可变、借用的二维水平 CT 扫描切片 (HU 值).
pub struct ScanSlice<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::ScanVolume`].
    ///
    /// 这里有意把代码写死为 `ArrayView` 降低灵活性, 但使结构的意图更加明确.
    data: ArrayView2<'a, f32>,
}

impl Index<Idx2d> for ScanSlice<'_> {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl<'a> ScanSlice<'a> {
    /// 从二维视图创建切片.
    #[inline]
    pub fn new(data: ArrayView2<'a, f32>) -> Self {
        Self { data }
    }

    /// 切片形状, 按 (高, 宽) 排列.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        let s = self.data.shape();
        (s[0], s[1])
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, f32, Ix2> {
        self.data.iter()
    }

    /// 获取携带 (高, 宽) 索引信息的像素迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> impl Iterator<Item = (Idx2d, &f32)> {
        self.data.indexed_iter()
    }

    /// 获得底层数据的一份不可变 shallow copy.
    #[inline]
    pub fn array_view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }
}

/// 不可变、借用的二维水平结节标注切片.
pub struct MaskSlice<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::MaskVolume`].
    data: ArrayView2<'a, u8>,
}

impl Index<Idx2d> for MaskSlice<'_> {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl<'a> MaskSlice<'a> {
    /// 从二维视图创建切片.
    #[inline]
    pub fn new(data: ArrayView2<'a, u8>) -> Self {
        Self { data }
    }

    /// 切片形状, 按 (高, 宽) 排列.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        let s = self.data.shape();
        (s[0], s[1])
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, u8, Ix2> {
        self.data.iter()
    }

    /// 获取携带 (高, 宽) 索引信息的像素迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> impl Iterator<Item = (Idx2d, &u8)> {
        self.data.indexed_iter()
    }

    /// 获得底层数据的一份不可变 shallow copy.
    #[inline]
    pub fn array_view(&self) -> ArrayView2<'_, u8> {
        self.data.view()
    }

    /// 切片是否全为背景.
    #[inline]
    pub fn is_background(&self) -> bool {
        self.iter().all(|p| is_background(*p))
    }

    /// 切片中前景像素个数.
    #[inline]
    pub fn foreground_count(&self) -> usize {
        self.iter().filter(|p| is_nodule(**p)).count()
    }
}

/// 表明一个可以通过 **可视化友好** 模式持久化存储的图像对象.
///
/// `SliceWriteVis` trait 的意图是, 图像将以 "可视化友好"
/// 的方式保存, 而不是 "as is" 的方式. 这意味着, 对于 `MaskSlice`
/// 这类仅存在 0, 1 像素值的图像, 在保存时会映射到肉眼较易区分的形式;
/// 对于 `ScanSlice` 这类以 CT HU 值存储的扫描,
/// 在保存时会用肺结节可视化窗口规范化.
pub trait SliceWriteVis {
    /// 按照一定的可视化规则将图片保存到 `path` 路径.
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 表明一个可以通过 **按原样** 模式持久化存储的图像对象.
///
/// `SliceWriteRaw` trait 的额外意图是, 图像将按原样保存. 这意味着,
/// `MaskSlice` 这类图像可以直接逐像素落盘, 但该模式不适用于
/// `ScanSlice` 这类以 CT HU 值存储的扫描.
pub trait SliceWriteRaw {
    /// 按原样将图片保存到 `path` 路径.
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 使像素更有利于单通道可视化.
#[inline]
pub(crate) fn pretty(label: u8) -> u8 {
    match label {
        // 背景为黑色
        NODULE_BACKGROUND => BLACK,

        // 结节为白色
        NODULE_FOREGROUND => WHITE,

        any_else => panic!("只允许图像存在 0, 1 像素, 但发现了 `{any_else}`"),
    }
}

/// 会将背景/结节像素分别映射为黑色/白色. 不允许其他颜色.
impl SliceWriteVis for MaskSlice<'_> {
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.indexed_iter() {
            buf.put_pixel(w as u32, h as u32, Luma([pretty(pix)]));
        }
        buf.save(path)
    }
}

/// 按原样存储.
impl SliceWriteRaw for MaskSlice<'_> {
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.indexed_iter() {
            buf.put_pixel(w as u32, h as u32, Luma([pix]));
        }
        buf.save(path)
    }
}

/// 窗范围 \[-1000, 400\] HU.
impl SliceWriteVis for ScanSlice<'_> {
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        const WINDOW: HuWindow = HuWindow::from_nodule_visual();
        for ((h, w), &hu) in self.indexed_iter() {
            let gray = WINDOW.eval(hu).unwrap_or(u8::MIN);
            buf.put_pixel(w as u32, h as u32, Luma([gray]));
        }
        buf.save(path)
    }
}

/// 将激活热度图以红色通道叠加到扫描切片上, 保存为 RGB 图像.
///
/// `heat` 的取值应在 `[0, 1]` (超出部分会被裁剪); 若给出 `mask`,
/// 前景像素会以绿色通道描出. `scan` 中的像素应已归一化到 `[0, 1]`
/// (即 VOI 样本的量纲), 否则可视化结果无意义.
///
/// `heat` 或 `mask` 形状与 `scan` 不一致时程序 panic.
pub fn save_heat_overlay<P: AsRef<Path>>(
    scan: &ScanSlice<'_>,
    heat: ArrayView2<'_, f32>,
    mask: Option<&MaskSlice<'_>>,
    path: P,
) -> ImageResult<()> {
    let (height, width) = scan.shape();
    assert_eq!((heat.shape()[0], heat.shape()[1]), (height, width));
    if let Some(m) = mask {
        assert_eq!(m.shape(), (height, width));
    }

    let mut buf = image::RgbImage::new(width as u32, height as u32);
    for ((h, w), &v) in scan.indexed_iter() {
        let gray = (v.clamp(0.0, 1.0) * 255.0) as u8;
        let a = heat[[h, w]].clamp(0.0, 1.0);
        let r = (gray as f32 * (1.0 - a) + 255.0 * a) as u8;
        let mut g = (gray as f32 * (1.0 - a)) as u8;
        let b = (gray as f32 * (1.0 - a)) as u8;
        if mask.is_some_and(|m| is_nodule(m[(h, w)])) {
            g = g.saturating_add(96);
        }
        buf.put_pixel(w as u32, h as u32, Rgb([r, g, b]));
    }
    buf.save(path)
}
