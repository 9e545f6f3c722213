//! 空间变换的几何内核.

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::Off3d;

/// 对体数据整体平移 `offset` 个体素, 越界部分用 `fill` 填充.
///
/// `offset` 按 `(z, h, w)` 排列, 正方向为索引增长方向.
pub(super) fn translate<T: Copy>(volume: &Array3<T>, offset: Off3d, fill: T) -> Array3<T> {
    let shape = volume.dim();
    let mut out = Array3::from_elem(shape, fill);
    let (sz, dz) = shift_ranges(shape.0, offset.0);
    let (sh, dh) = shift_ranges(shape.1, offset.1);
    let (sw, dw) = shift_ranges(shape.2, offset.2);
    if [&sz, &sh, &sw].iter().any(|r| r.is_empty()) {
        return out;
    }

    out.slice_mut(ndarray::s![dz, dh, dw])
        .assign(&volume.slice(ndarray::s![sz, sh, sw]));
    out
}

/// 单轴平移区间: 返回 (源区间, 目标区间). 两区间长度相等.
fn shift_ranges(len: usize, offset: isize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let src_start = (-offset).clamp(0, len as isize) as usize;
    let src_end = (len as isize - offset.max(0)).clamp(0, len as isize) as usize;
    let src_end = src_end.max(src_start);
    let dst_start = offset.clamp(0, len as isize) as usize;
    (src_start..src_end, dst_start..dst_start + (src_end - src_start))
}

/// 逐水平切片做平面内旋转, image 双线性插值, 越界填 `fill`.
///
/// `angle_deg` 为逆时针角度 (以 h 向下、w 向右的图像坐标观察为顺时针).
pub(super) fn rotate_image(volume: &Array3<f32>, angle_deg: f64, fill: f32) -> Array3<f32> {
    let mut out = volume.clone();
    for (src, mut dst) in volume
        .axis_iter(Axis(0))
        .zip(out.axis_iter_mut(Axis(0)))
    {
        let rotated = rotate_slice_bilinear(src, angle_deg, fill);
        dst.assign(&rotated);
    }
    out
}

/// 逐水平切片做平面内旋转, mask 最近邻插值, 越界填背景.
pub(super) fn rotate_mask(volume: &Array3<u8>, angle_deg: f64) -> Array3<u8> {
    let mut out = volume.clone();
    for (src, mut dst) in volume
        .axis_iter(Axis(0))
        .zip(out.axis_iter_mut(Axis(0)))
    {
        let rotated = rotate_slice_nearest(src, angle_deg);
        dst.assign(&rotated);
    }
    out
}

/// 以切片中心为轴的逆旋转采样坐标.
#[inline]
fn source_pos(
    (oh, ow): (usize, usize),
    (ch, cw): (f64, f64),
    (sin, cos): (f64, f64),
) -> (f64, f64) {
    let (dh, dw) = (oh as f64 - ch, ow as f64 - cw);
    (ch + cos * dh + sin * dw, cw - sin * dh + cos * dw)
}

fn rotate_slice_bilinear(src: ArrayView2<'_, f32>, angle_deg: f64, fill: f32) -> Array2<f32> {
    let (height, width) = (src.shape()[0], src.shape()[1]);
    let center = ((height as f64 - 1.0) / 2.0, (width as f64 - 1.0) / 2.0);
    let (sin, cos) = angle_deg.to_radians().sin_cos();

    Array2::from_shape_fn((height, width), |pos| {
        let (sh, sw) = source_pos(pos, center, (sin, cos));
        bilinear(src, sh, sw).unwrap_or(fill)
    })
}

fn rotate_slice_nearest(src: ArrayView2<'_, u8>, angle_deg: f64) -> Array2<u8> {
    let (height, width) = (src.shape()[0], src.shape()[1]);
    let center = ((height as f64 - 1.0) / 2.0, (width as f64 - 1.0) / 2.0);
    let (sin, cos) = angle_deg.to_radians().sin_cos();

    Array2::from_shape_fn((height, width), |pos| {
        let (sh, sw) = source_pos(pos, center, (sin, cos));
        let (h, w) = (sh.round(), sw.round());
        if h < 0.0 || w < 0.0 || h >= height as f64 || w >= width as f64 {
            0
        } else {
            src[[h as usize, w as usize]]
        }
    })
}

/// 双线性采样. 采样点完全落在图像外时返回 `None`.
fn bilinear(src: ArrayView2<'_, f32>, h: f64, w: f64) -> Option<f32> {
    let (height, width) = (src.shape()[0] as f64, src.shape()[1] as f64);
    if h <= -1.0 || w <= -1.0 || h >= height || w >= width {
        return None;
    }

    let (h0, w0) = (h.floor(), w.floor());
    let (fh, fw) = (h - h0, w - w0);
    let sample = |hh: f64, ww: f64| -> f64 {
        if hh < 0.0 || ww < 0.0 || hh >= height || ww >= width {
            0.0
        } else {
            src[[hh as usize, ww as usize]] as f64
        }
    };

    let v00 = sample(h0, w0);
    let v01 = sample(h0, w0 + 1.0);
    let v10 = sample(h0 + 1.0, w0);
    let v11 = sample(h0 + 1.0, w0 + 1.0);
    let top = v00 * (1.0 - fw) + v01 * fw;
    let bottom = v10 * (1.0 - fw) + v11 * fw;
    Some((top * (1.0 - fh) + bottom * fh) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_shift_ranges() {
        assert_eq!(shift_ranges(5, 0), (0..5, 0..5));
        assert_eq!(shift_ranges(5, 2), (0..3, 2..5));
        assert_eq!(shift_ranges(5, -2), (2..5, 0..3));
        assert_eq!(shift_ranges(5, 7), (0..0, 5..5));
    }

    #[test]
    fn test_translate_marker() {
        let mut vol = Array3::<f32>::zeros((3, 5, 5));
        vol[[1, 2, 2]] = 1.0;
        let moved = translate(&vol, (1, -1, 0), 0.0);
        assert!(float_eq(moved[[2, 1, 2]], 1.0));
        assert!(float_eq(moved[[1, 2, 2]], 0.0));
        // 填充区.
        assert!(float_eq(moved[[0, 4, 4]], 0.0));
    }

    #[test]
    fn test_rotate_quarter_turn() {
        // 中心 (2, 2), marker 在其上方 (1, 2).
        let mut vol = Array3::<f32>::zeros((1, 5, 5));
        vol[[0, 1, 2]] = 1.0;
        let rot = rotate_image(&vol, 90.0, 0.0);
        assert!(float_eq(rot[[0, 2, 1]], 1.0));
        assert!(float_eq(rot[[0, 1, 2]], 0.0));

        let mut mask = Array3::<u8>::zeros((1, 5, 5));
        mask[[0, 1, 2]] = 1;
        let rot = rotate_mask(&mask, 90.0);
        assert_eq!(rot[[0, 2, 1]], 1);
        assert_eq!(rot[[0, 1, 2]], 0);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let mut vol = Array3::<f32>::zeros((2, 4, 4));
        vol[[0, 1, 3]] = 0.7;
        vol[[1, 2, 0]] = 0.3;
        let rot = rotate_image(&vol, 0.0, 0.0);
        assert_eq!(rot, vol);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = array![[0.0f32, 1.0], [0.0, 1.0]];
        let v = bilinear(img.view(), 0.5, 0.5).unwrap();
        assert!(float_eq(v, 0.5));
        assert!(bilinear(img.view(), -2.0, 0.0).is_none());
    }

    #[test]
    fn test_rotate_mask_stays_binary() {
        let mut mask = Array3::<u8>::zeros((1, 8, 8));
        for h in 2..6 {
            for w in 2..6 {
                mask[[0, h, w]] = 1;
            }
        }
        let rot = rotate_mask(&mask, 33.0);
        assert!(rot.iter().all(|p| *p <= 1));
    }
}
