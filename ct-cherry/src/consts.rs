//! 通用常量.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::Idx3d;

/// 单通道结节标注值.
pub mod gray {
    /// LUNA23 mask 中, 背景的体素值.
    pub const NODULE_BACKGROUND: u8 = 0;

    /// LUNA23 mask 中, 结节前景的体素值.
    pub const NODULE_FOREGROUND: u8 = 1;

    /// 单通道黑色.
    pub const BLACK: u8 = 0b_0000_0000;

    /// 单通道白色.
    pub const WHITE: u8 = 0b_1111_1111;

    /// 体素是否是结节前景?
    #[inline]
    pub const fn is_nodule(p: u8) -> bool {
        matches!(p, NODULE_FOREGROUND)
    }

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, NODULE_BACKGROUND)
    }
}

/// VOI 的固定形状, 按 `(z, H, W)` 排列.
///
/// 所有进入网络的样本都会被裁剪/填充到该形状.
pub const VOI_SHAPE: Idx3d = (64, 128, 128);

/// VOI 物理边长参考值 (单位: 毫米). 原始标注以该尺度圈定结节.
pub const VOI_SIZE_MM: f64 = 50.0;

/// 默认 HU 窗下限. 空气的 HU 值.
pub const DEFAULT_HU_LOW: f32 = -1000.0;

/// 默认 HU 窗上限. 覆盖钙化结节的软组织上界.
pub const DEFAULT_HU_HIGH: f32 = 400.0;

/// 结节类型类别数.
pub const NUM_NODULE_TYPES: usize = 4;

/// 交叉验证折数默认值.
pub const DEFAULT_FOLDS: usize = 5;

/// 数据集划分的默认随机种子.
pub const DEFAULT_SPLIT_SEED: u64 = 2023;

/// 结节类型. 判别值即 labels 表中的整数编码.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoduleType {
    /// 磨玻璃结节 (ground-glass opacity).
    GroundGlass = 0,

    /// 部分实性结节.
    PartSolid = 1,

    /// 实性结节.
    Solid = 2,

    /// 钙化结节.
    Calcified = 3,
}

/// 结节类型名称到枚举的映射表. 包含常见别名
/// (如 `NonSolid` / `GroundGlassOpacity` / `Mixed`).
pub static NODULETYPE_MAPPING: Lazy<HashMap<&'static str, NoduleType>> = Lazy::new(|| {
    HashMap::from([
        ("GroundGlass", NoduleType::GroundGlass),
        ("GroundGlassOpacity", NoduleType::GroundGlass),
        ("NonSolid", NoduleType::GroundGlass),
        ("PartSolid", NoduleType::PartSolid),
        ("Mixed", NoduleType::PartSolid),
        ("Solid", NoduleType::Solid),
        ("Calcified", NoduleType::Calcified),
    ])
});

impl NoduleType {
    /// 全部类型, 按整数编码升序.
    pub const ALL: [NoduleType; NUM_NODULE_TYPES] = [
        NoduleType::GroundGlass,
        NoduleType::PartSolid,
        NoduleType::Solid,
        NoduleType::Calcified,
    ];

    /// 该类型的整数编码.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 从整数编码构建. 编码超出范围时返回 `None`.
    #[inline]
    pub fn from_index(idx: usize) -> Option<NoduleType> {
        Self::ALL.get(idx).copied()
    }

    /// 从名称或别名构建. 未知名称返回 `None`.
    #[inline]
    pub fn from_name(name: &str) -> Option<NoduleType> {
        NODULETYPE_MAPPING.get(name).copied()
    }

    /// 该类型的规范名称.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            NoduleType::GroundGlass => "GroundGlass",
            NoduleType::PartSolid => "PartSolid",
            NoduleType::Solid => "Solid",
            NoduleType::Calcified => "Calcified",
        }
    }
}

/// 恶性程度二分类标签.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Malignancy {
    /// 良性.
    Benign = 0,

    /// 恶性.
    Malignant = 1,
}

impl Malignancy {
    /// 该标签的整数编码.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 从整数编码构建. 编码不是 0/1 时返回 `None`.
    #[inline]
    pub fn from_index(idx: usize) -> Option<Malignancy> {
        match idx {
            0 => Some(Malignancy::Benign),
            1 => Some(Malignancy::Malignant),
            _ => None,
        }
    }

    /// 是否为恶性.
    #[inline]
    pub fn is_malignant(&self) -> bool {
        matches!(self, Self::Malignant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noduletype_roundtrip() {
        for t in NoduleType::ALL {
            assert_eq!(NoduleType::from_index(t.index()), Some(t));
            assert_eq!(NoduleType::from_name(t.name()), Some(t));
        }
        assert_eq!(NoduleType::from_index(4), None);
    }

    #[test]
    fn test_noduletype_aliases() {
        assert_eq!(
            NoduleType::from_name("NonSolid"),
            Some(NoduleType::GroundGlass)
        );
        assert_eq!(NoduleType::from_name("Mixed"), Some(NoduleType::PartSolid));
        assert_eq!(NoduleType::from_name("solid"), None);
    }

    #[test]
    fn test_malignancy_codes() {
        assert_eq!(Malignancy::from_index(0), Some(Malignancy::Benign));
        assert_eq!(Malignancy::from_index(1), Some(Malignancy::Malignant));
        assert_eq!(Malignancy::from_index(2), None);
        assert!(Malignancy::Malignant.is_malignant());
        assert!(!Malignancy::Benign.is_malignant());
    }
}
