use ndarray::ArrayViewMut3;

/// HU 窗口, 包含窗位 (window level) 和窗宽 (window width).
///
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HuWindow {
    level: f32,
    width: f32,
}

impl Default for HuWindow {
    #[inline]
    fn default() -> Self {
        Self::from_nodule_visual()
    }
}

impl HuWindow {
    /// 构建 HU 窗.
    ///
    /// `level` 和 `width` 必须在合理范围内, 否则返回 `None`.
    pub fn new(level: f32, width: f32) -> Option<HuWindow> {
        if (-1e5..=1e5).contains(&level) && 0.0 < width && width <= 1e5 {
            Some(Self { level, width })
        } else {
            None
        }
    }

    /// 从窗上下限构建 HU 窗. 要求 `low < high` 且均在合理范围内, 否则返回 `None`.
    pub fn from_bounds(low: f32, high: f32) -> Option<HuWindow> {
        if low >= high {
            return None;
        }
        Self::new((low + high) / 2.0, high - low)
    }

    /// 构建一个便于观察肺结节的 HU 窗口. 窗范围为
    /// \[[`DEFAULT_HU_LOW`], [`DEFAULT_HU_HIGH`]\] = \[-1000, 400\] HU,
    /// 下至空气, 上覆钙化结节.
    ///
    /// [`DEFAULT_HU_LOW`]: crate::consts::DEFAULT_HU_LOW
    /// [`DEFAULT_HU_HIGH`]: crate::consts::DEFAULT_HU_HIGH
    #[inline]
    pub const fn from_nodule_visual() -> HuWindow {
        Self {
            level: -300.0,
            width: 1400.0,
        }
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f32 {
        self.level - self.width / 2.0
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f32 {
        self.level + self.width / 2.0
    }

    /// 窗位.
    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f32 {
        self.width
    }

    /// 求在当前 HU 窗设置下, `ct` HU 值对应的灰度图像素整数值 (0 <= value <= 255).
    ///
    /// 如果 `ct` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval(&self, ct: f32) -> Option<u8> {
        if !ct.is_finite() {
            return None;
        }
        let lb = self.lower_bound();
        if ct <= lb {
            Some(u8::MIN)
        } else if ct >= self.upper_bound() {
            Some(u8::MAX)
        } else {
            // 255, not 256.
            Some((((ct - lb) / self.width()) * 255.0) as u8)
        }
    }

    /// 求在当前 HU 窗设置下, `ct` HU 值对应的归一化分布点 (0.0 <= value <= 1.0).
    /// 网络输入使用该量纲.
    ///
    /// 如果 `ct` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval01(&self, ct: f32) -> Option<f32> {
        if !ct.is_finite() {
            return None;
        }
        let lb = self.lower_bound();
        let ub = self.upper_bound();
        if ct <= lb {
            Some(0.0)
        } else if ct >= ub {
            Some(1.0)
        } else {
            Some((ct - lb) / self.width())
        }
    }

    /// 将体数据整体裁剪并归一化到 `[0, 1]`, 原地修改.
    ///
    /// 无意义的 HU 值 (inf, NaN) 统一映射为 0.0.
    pub fn normalize_volume(&self, mut volume: ArrayViewMut3<'_, f32>) {
        volume.mapv_inplace(|hu| self.eval01(hu).unwrap_or(0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::HuWindow;
    use ndarray::Array3;

    fn is_valid_init(level: f32, width: f32) -> bool {
        HuWindow::new(level, width).is_some()
    }

    #[test]
    fn test_hu_window_invalid_input() {
        assert!(!is_valid_init(0.0, -1.0));
        assert!(!is_valid_init(0.0, 0.0));
        assert!(HuWindow::from_bounds(400.0, -1000.0).is_none());
    }

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_hu_window_generic() {
        // [60, 100]
        let win = HuWindow::new(80.0, 40.0).unwrap();
        assert_eq!(win.eval(f32::NAN), None);
        assert_eq!(win.eval(f32::MIN), Some(0));
        assert_eq!(win.eval(f32::MAX), Some(255));

        assert_eq!(win.eval(50.0), Some(0));
        assert!(float_eq(win.eval01(50.0).unwrap(), 0.0));

        assert_eq!(win.eval(60.0), Some(0));
        assert!(float_eq(win.eval01(60.0).unwrap(), 0.0));

        // boundary 1
        assert_eq!(win.eval(60.1), Some(0));
        assert!(win.eval01(60.1).unwrap() > 0.0);
        assert!(win.eval01(60.1).unwrap() < 1.0 / 255.0);
        // -- boundary 1

        assert_eq!(win.eval(70.0).unwrap(), (255.0 * 0.25) as u8);
        assert!(float_eq(win.eval01(70.0).unwrap(), 0.25));

        assert_eq!(win.eval(80.0).unwrap(), (255.0 * 0.5) as u8);
        assert!(float_eq(win.eval01(80.0).unwrap(), 0.5));

        assert_eq!(win.eval(90.0).unwrap(), (255.0 * 0.75) as u8);
        assert!(float_eq(win.eval01(90.0).unwrap(), 0.75));

        // boundary 2
        assert_eq!(win.eval(99.999), Some(254));
        assert!(win.eval01(99.999).unwrap() < 1.0);
        assert!(win.eval01(99.999).unwrap() > 254.0 / 255.0);
        // -- boundary 2

        assert_eq!(win.eval(100.0).unwrap(), u8::MAX);
        assert!(float_eq(win.eval01(100.0).unwrap(), 1.0));
    }

    #[test]
    fn test_nodule_visual_bounds() {
        let win = HuWindow::from_nodule_visual();
        assert!(float_eq(win.lower_bound(), -1000.0));
        assert!(float_eq(win.upper_bound(), 400.0));
        assert!(float_eq(win.eval01(-1000.0).unwrap(), 0.0));
        assert!(float_eq(win.eval01(400.0).unwrap(), 1.0));
        assert!(float_eq(win.eval01(-300.0).unwrap(), 0.5));
    }

    #[test]
    fn test_normalize_volume_in_place() {
        let win = HuWindow::from_nodule_visual();
        let mut vol = Array3::<f32>::from_elem((2, 2, 2), -1000.0);
        vol[[0, 0, 0]] = 400.0;
        vol[[0, 0, 1]] = f32::NAN;
        vol[[0, 1, 0]] = -300.0;
        win.normalize_volume(vol.view_mut());

        assert!(float_eq(vol[[0, 0, 0]], 1.0));
        assert!(float_eq(vol[[0, 0, 1]], 0.0));
        assert!(float_eq(vol[[0, 1, 0]], 0.5));
        assert!(float_eq(vol[[1, 1, 1]], 0.0));
    }
}
