//! 数据增广.
//!
//! 变换按固定顺序执行: 翻转 -> 平面内旋转 -> 平移 -> 强度缩放 -> 高斯噪声.
//! 空间变换对 image 和 mask 施加完全一致的参数; 强度变换只作用于 image.
//! 全部随机性由调用方给出的种子唯一确定, 相同 (参数, 种子)
//! 下的两次增广逐体素相同.

mod imp;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::VoiSample;
use crate::error::{ConfigError, ConfigResult};
use crate::{Idx3d, Off3d};

/// 增广参数. 经 [`AugmentSpec::new`] 校验后不可变.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AugmentSpec {
    /// 各轴翻转概率, 按 `(z, h, w)` 排列.
    flip: [f64; 3],

    /// 平面内旋转角上限 (度). 实际角度在 `[-rotate_deg, rotate_deg]` 均匀抽取.
    rotate_deg: f64,

    /// 各轴平移上限 (体素), 按 `(z, h, w)` 排列.
    /// 实际偏移在 `[-t, t]` 均匀抽取.
    translate: Idx3d,

    /// 强度乘性缩放范围 `[low, high]`.
    scale: (f64, f64),

    /// 加性高斯噪声标准差 (归一化强度量纲).
    noise_std: f64,
}

impl AugmentSpec {
    /// 构建并校验增广参数.
    ///
    /// 校验规则: 翻转概率在 `[0, 1]`; 旋转角上限在 `[0, 180]`;
    /// 缩放范围满足 `0 < low <= high`; 噪声标准差非负且有限.
    /// 违反任一规则返回 [`ConfigError::OutOfRange`].
    pub fn new(
        flip: [f64; 3],
        rotate_deg: f64,
        translate: Idx3d,
        scale: (f64, f64),
        noise_std: f64,
    ) -> ConfigResult<AugmentSpec> {
        for p in flip {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::out_of_range(
                    "flip",
                    format!("probability must be in [0, 1], got {p}"),
                ));
            }
        }
        if !(0.0..=180.0).contains(&rotate_deg) {
            return Err(ConfigError::out_of_range(
                "rotate_deg",
                format!("must be in [0, 180], got {rotate_deg}"),
            ));
        }
        let (low, high) = scale;
        if !(low.is_finite() && high.is_finite() && 0.0 < low && low <= high) {
            return Err(ConfigError::out_of_range(
                "scale",
                format!("need 0 < low <= high, got [{low}, {high}]"),
            ));
        }
        if !(noise_std.is_finite() && noise_std >= 0.0) {
            return Err(ConfigError::out_of_range(
                "noise_std",
                format!("must be finite and non-negative, got {noise_std}"),
            ));
        }
        Ok(Self {
            flip,
            rotate_deg,
            translate,
            scale,
            noise_std,
        })
    }

    /// 训练用的轻量增广: 三轴翻转各 0.5, 旋转 ±20°, 平移 (2, 8, 8),
    /// 缩放 \[0.9, 1.1\], 噪声 0.02.
    pub fn light() -> AugmentSpec {
        Self::new([0.5, 0.5, 0.5], 20.0, (2, 8, 8), (0.9, 1.1), 0.02).unwrap()
    }

    /// 恒等变换. 验证/推理侧使用.
    pub fn none() -> AugmentSpec {
        Self::new([0.0, 0.0, 0.0], 0.0, (0, 0, 0), (1.0, 1.0), 0.0).unwrap()
    }

    /// 重新执行 [`AugmentSpec::new`] 的全部校验.
    /// 面向绕过构造函数得到的实例 (如反序列化结果).
    pub fn validate(&self) -> ConfigResult<()> {
        Self::new(
            self.flip,
            self.rotate_deg,
            self.translate,
            self.scale,
            self.noise_std,
        )
        .map(drop)
    }

    /// 各轴翻转概率.
    #[inline]
    pub fn flip(&self) -> [f64; 3] {
        self.flip
    }

    /// 旋转角上限 (度).
    #[inline]
    pub fn rotate_deg(&self) -> f64 {
        self.rotate_deg
    }

    /// 各轴平移上限 (体素).
    #[inline]
    pub fn translate(&self) -> Idx3d {
        self.translate
    }

    /// 强度缩放范围.
    #[inline]
    pub fn scale(&self) -> (f64, f64) {
        self.scale
    }

    /// 噪声标准差.
    #[inline]
    pub fn noise_std(&self) -> f64 {
        self.noise_std
    }
}

/// 由 (实验种子, epoch, 样本序号) 派生单个样本的增广种子.
///
/// 简单整数混合; 相同输入恒得到相同种子.
#[inline]
pub fn sample_seed(base_seed: u64, epoch: u64, sample_seq: u64) -> u64 {
    base_seed
        .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(sample_seq.wrapping_mul(0xC2B2_AE3D_27D4_EB4F))
}

/// 增广执行器.
#[derive(Debug, Clone)]
pub struct Augmenter {
    spec: AugmentSpec,
}

impl Augmenter {
    /// 从校验过的参数创建执行器.
    #[inline]
    pub fn new(spec: AugmentSpec) -> Augmenter {
        Self { spec }
    }

    /// 增广参数.
    #[inline]
    pub fn spec(&self) -> &AugmentSpec {
        &self.spec
    }

    /// 对样本原地施加一次增广, 随机性完全由 `seed` 确定.
    ///
    /// 抽取顺序固定: 3 次翻转判定, 1 次旋转角, 3 次平移量,
    /// 1 次缩放因子, 最后是逐体素噪声 (仅当 `noise_std > 0` 时消耗随机流).
    pub fn apply(&self, sample: &mut VoiSample, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let spec = &self.spec;

        let flips = [
            rng.gen_bool(spec.flip[0]),
            rng.gen_bool(spec.flip[1]),
            rng.gen_bool(spec.flip[2]),
        ];
        let angle = rng.gen_range(-spec.rotate_deg..=spec.rotate_deg);
        let (tz, th, tw) = spec.translate;
        let offset: Off3d = (
            rng.gen_range(-(tz as isize)..=tz as isize),
            rng.gen_range(-(th as isize)..=th as isize),
            rng.gen_range(-(tw as isize)..=tw as isize),
        );
        let factor = rng.gen_range(spec.scale.0..=spec.scale.1) as f32;

        // 1. 翻转.
        for (axis, apply) in flips.into_iter().enumerate() {
            if apply {
                sample.image.invert_axis(ndarray::Axis(axis));
                if let Some(mask) = &mut sample.mask {
                    mask.invert_axis(ndarray::Axis(axis));
                }
            }
        }

        // 2. 平面内旋转.
        if angle != 0.0 {
            sample.image = imp::rotate_image(&sample.image, angle, 0.0);
            if let Some(mask) = &mut sample.mask {
                *mask = imp::rotate_mask(mask, angle);
            }
        }

        // 3. 平移.
        if offset != (0, 0, 0) {
            sample.image = imp::translate(&sample.image, offset, 0.0);
            if let Some(mask) = &mut sample.mask {
                *mask = imp::translate(mask, offset, 0);
            }
        }

        // 4. 强度缩放.
        if factor != 1.0 {
            sample.image.mapv_inplace(|v| v * factor);
        }

        // 5. 高斯噪声.
        if spec.noise_std > 0.0 {
            let mut gauss = Gaussian::new(spec.noise_std);
            sample
                .image
                .mapv_inplace(|v| v + gauss.next(&mut rng) as f32);
        }
    }
}

/// Box-Muller 高斯采样器. 每两次均匀抽取产出一对正态值, 备用值缓存.
struct Gaussian {
    std: f64,
    spare: Option<f64>,
}

impl Gaussian {
    #[inline]
    fn new(std: f64) -> Self {
        Self { std, spare: None }
    }

    fn next(&mut self, rng: &mut StdRng) -> f64 {
        if let Some(v) = self.spare.take() {
            return v * self.std;
        }
        // u1 取自 (0, 1], 避免 ln(0).
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some(radius * theta.sin());
        radius * theta.cos() * self.std
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::VoiSample;
    use ndarray::Array3;

    fn marker_sample() -> VoiSample {
        let mut image = Array3::<f32>::zeros((4, 6, 6));
        let mut mask = Array3::<u8>::zeros((4, 6, 6));
        image[[1, 2, 3]] = 1.0;
        mask[[1, 2, 3]] = 1;
        VoiSample {
            image,
            mask: Some(mask),
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(AugmentSpec::new([1.1, 0.0, 0.0], 0.0, (0, 0, 0), (1.0, 1.0), 0.0).is_err());
        assert!(AugmentSpec::new([0.0; 3], 181.0, (0, 0, 0), (1.0, 1.0), 0.0).is_err());
        assert!(AugmentSpec::new([0.0; 3], 0.0, (0, 0, 0), (0.0, 1.0), 0.0).is_err());
        assert!(AugmentSpec::new([0.0; 3], 0.0, (0, 0, 0), (1.2, 1.1), 0.0).is_err());
        assert!(AugmentSpec::new([0.0; 3], 0.0, (0, 0, 0), (1.0, 1.0), -0.1).is_err());
        assert!(AugmentSpec::light().noise_std() > 0.0);
    }

    #[test]
    fn test_identity_spec_is_noop() {
        let mut sample = marker_sample();
        let before = sample.image.clone();
        Augmenter::new(AugmentSpec::none()).apply(&mut sample, 7);
        assert_eq!(sample.image, before);
        assert_eq!(sample.foreground_count(), 1);
    }

    #[test]
    fn test_flip_moves_image_and_mask_together() {
        // 翻转概率全 1, 其余变换关闭: 结果确定.
        let spec = AugmentSpec::new([1.0, 1.0, 1.0], 0.0, (0, 0, 0), (1.0, 1.0), 0.0).unwrap();
        let mut sample = marker_sample();
        Augmenter::new(spec).apply(&mut sample, 0);

        // (1, 2, 3) -> (4-1-1, 6-2-1, 6-3-1) = (2, 3, 2).
        assert_eq!(sample.image[[2, 3, 2]], 1.0);
        let mask = sample.mask.as_ref().unwrap();
        assert_eq!(mask[[2, 3, 2]], 1);
        assert_eq!(sample.foreground_count(), 1);
    }

    #[test]
    fn test_same_seed_same_output() {
        let aug = Augmenter::new(AugmentSpec::light());
        let (mut a, mut b) = (marker_sample(), marker_sample());
        aug.apply(&mut a, 42);
        aug.apply(&mut b, 42);
        assert_eq!(a.image, b.image);
        assert_eq!(a.mask, b.mask);
    }

    #[test]
    fn test_different_seed_differs() {
        let aug = Augmenter::new(AugmentSpec::light());
        let (mut a, mut b) = (marker_sample(), marker_sample());
        aug.apply(&mut a, 42);
        aug.apply(&mut b, 43);
        assert_ne!(a.image, b.image);
    }

    #[test]
    fn test_mask_stays_binary_under_full_pipeline() {
        let aug = Augmenter::new(AugmentSpec::light());
        for seed in 0..8 {
            let mut sample = marker_sample();
            aug.apply(&mut sample, seed);
            let mask = sample.mask.as_ref().unwrap();
            assert!(mask.iter().all(|p| *p <= 1));
            assert_eq!(sample.shape(), (4, 6, 6));
        }
    }

    #[test]
    fn test_sample_seed_mixing() {
        assert_eq!(sample_seed(1, 2, 3), sample_seed(1, 2, 3));
        assert_ne!(sample_seed(1, 2, 3), sample_seed(1, 2, 4));
        assert_ne!(sample_seed(1, 2, 3), sample_seed(1, 3, 3));
        assert_ne!(sample_seed(1, 2, 3), sample_seed(2, 2, 3));
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut gauss = Gaussian::new(1.0);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| gauss.next(&mut rng)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }
}
