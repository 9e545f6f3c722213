//! 评估指标.
//!
//! 分割侧提供 Dice 系数, 分类侧提供平衡准确率与 ROC-AUC.
//! 所有函数都只依赖宿主端标量/数组, 与训练后端无关.

use itertools::Itertools;
use ndarray::ArrayView3;
use ordered_float::OrderedFloat;

use crate::consts::gray::NODULE_FOREGROUND;

/// 由前景体素计数计算 Dice 系数.
///
/// `intersection` 为两者交集的体素数, `pred` 与 `truth` 为各自的
/// 前景体素数. 两侧都为空时约定 Dice 为 1.
#[inline]
pub fn dice_from_counts(intersection: usize, pred: usize, truth: usize) -> f64 {
    if pred + truth == 0 {
        return 1.0;
    }
    2.0 * intersection as f64 / (pred + truth) as f64
}

/// 两个二值体数据之间的 Dice 系数.
///
/// # Panics
///
/// 两者形状不一致时 panic.
pub fn dice_coefficient(pred: ArrayView3<'_, u8>, truth: ArrayView3<'_, u8>) -> f64 {
    assert_eq!(
        pred.dim(),
        truth.dim(),
        "dice operands must share one shape"
    );
    let mut inter = 0usize;
    let mut p = 0usize;
    let mut t = 0usize;
    for (&a, &b) in pred.iter().zip(truth.iter()) {
        let a = a == NODULE_FOREGROUND;
        let b = b == NODULE_FOREGROUND;
        inter += usize::from(a && b);
        p += usize::from(a);
        t += usize::from(b);
    }
    dice_from_counts(inter, p, t)
}

/// 平衡准确率: 各类别召回率的算术平均, 仅统计真值中出现过的类别.
///
/// 输入为空时返回 `None`.
///
/// # Panics
///
/// 两个切片长度不一致时 panic.
pub fn balanced_accuracy(pred: &[usize], truth: &[usize], num_classes: usize) -> Option<f64> {
    assert_eq!(pred.len(), truth.len(), "prediction/truth length mismatch");
    if truth.is_empty() || num_classes == 0 {
        return None;
    }

    let mut hits = vec![0usize; num_classes];
    let mut totals = vec![0usize; num_classes];
    for (&p, &t) in pred.iter().zip(truth.iter()) {
        debug_assert!(t < num_classes && p < num_classes);
        totals[t] += 1;
        hits[t] += usize::from(p == t);
    }

    let mut recall_sum = 0.0;
    let mut present = 0usize;
    for (hit, total) in hits.into_iter().zip(totals) {
        if total > 0 {
            recall_sum += hit as f64 / total as f64;
            present += 1;
        }
    }
    (present > 0).then(|| recall_sum / present as f64)
}

/// 二分类 ROC-AUC, 秩和法 (Mann-Whitney U), 并列分数取平均秩.
///
/// `labels[i]` 为真表示第 `i` 个样本为阳性. 只有单一类别时无定义,
/// 返回 `None`.
///
/// # Panics
///
/// 两个切片长度不一致时 panic.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    assert_eq!(scores.len(), labels.len(), "scores/labels length mismatch");
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by_key(|&i| OrderedFloat(scores[i]));

    // 并列段内共享平均秩 (1 起).
    let mut rank_pos_sum = 0.0;
    let mut next_rank = 1.0;
    for (_, run) in &order.iter().group_by(|&&i| OrderedFloat(scores[i])) {
        let mut len = 0usize;
        let mut pos = 0usize;
        for &k in run {
            len += 1;
            pos += usize::from(labels[k]);
        }
        let mean_rank = next_rank + (len as f64 - 1.0) / 2.0;
        next_rank += len as f64;
        rank_pos_sum += pos as f64 * mean_rank;
    }

    let u = rank_pos_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn float_eq(lhs: f64, rhs: f64) -> bool {
        (lhs - rhs).abs() < 1e-9
    }

    #[test]
    fn test_dice_identical_and_disjoint() {
        let mut a = Array3::<u8>::zeros((2, 4, 4));
        a[(0, 1, 1)] = 1;
        a[(1, 2, 2)] = 1;
        assert!(float_eq(dice_coefficient(a.view(), a.view()), 1.0));

        let mut b = Array3::<u8>::zeros((2, 4, 4));
        b[(0, 3, 3)] = 1;
        assert!(float_eq(dice_coefficient(a.view(), b.view()), 0.0));
    }

    #[test]
    fn test_dice_partial_overlap() {
        // pred 2 体素, truth 2 体素, 交 1 体素: 2*1/(2+2) = 0.5.
        let mut pred = Array3::<u8>::zeros((1, 3, 3));
        pred[(0, 0, 0)] = 1;
        pred[(0, 1, 1)] = 1;
        let mut truth = Array3::<u8>::zeros((1, 3, 3));
        truth[(0, 1, 1)] = 1;
        truth[(0, 2, 2)] = 1;
        assert!(float_eq(dice_coefficient(pred.view(), truth.view()), 0.5));
    }

    #[test]
    fn test_dice_both_empty() {
        let zero = Array3::<u8>::zeros((2, 2, 2));
        assert!(float_eq(dice_coefficient(zero.view(), zero.view()), 1.0));
        assert!(float_eq(dice_from_counts(0, 0, 0), 1.0));
    }

    #[test]
    fn test_counts_agree_with_volumes() {
        let mut pred = Array3::<u8>::zeros((1, 2, 2));
        pred[(0, 0, 0)] = 1;
        let mut truth = Array3::<u8>::zeros((1, 2, 2));
        truth[(0, 0, 0)] = 1;
        truth[(0, 0, 1)] = 1;
        let by_volume = dice_coefficient(pred.view(), truth.view());
        let by_counts = dice_from_counts(1, 1, 2);
        assert!(float_eq(by_volume, by_counts));
    }

    #[test]
    fn test_balanced_accuracy_known_value() {
        // 类 0: 3 对 2, 类 1: 1 对 1; (2/3 + 1) / 2 = 5/6.
        let truth = [0, 0, 0, 1];
        let pred = [0, 0, 1, 1];
        let got = balanced_accuracy(&pred, &truth, 2).unwrap();
        assert!(float_eq(got, 5.0 / 6.0));
    }

    #[test]
    fn test_balanced_accuracy_skips_absent_class() {
        // 4 类配置下只出现两类, 未出现的类不摊薄均值.
        let truth = [2, 2, 3, 3];
        let pred = [2, 3, 3, 3];
        let got = balanced_accuracy(&pred, &truth, 4).unwrap();
        assert!(float_eq(got, (0.5 + 1.0) / 2.0));
    }

    #[test]
    fn test_balanced_accuracy_empty() {
        assert!(balanced_accuracy(&[], &[], 2).is_none());
    }

    #[test]
    fn test_auc_known_value() {
        let scores = [0.1, 0.4, 0.35, 0.8];
        let labels = [false, false, true, true];
        assert!(float_eq(roc_auc(&scores, &labels).unwrap(), 0.75));
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let scores = [0.9, 0.8, 0.2, 0.1];
        let labels = [true, true, false, false];
        assert!(float_eq(roc_auc(&scores, &labels).unwrap(), 1.0));

        let inverted = [false, false, true, true];
        assert!(float_eq(roc_auc(&scores, &inverted).unwrap(), 0.0));
    }

    #[test]
    fn test_auc_ties_average() {
        let scores = [0.5, 0.5];
        let labels = [true, false];
        assert!(float_eq(roc_auc(&scores, &labels).unwrap(), 0.5));
    }

    #[test]
    fn test_auc_single_class() {
        assert!(roc_auc(&[0.2, 0.4], &[true, true]).is_none());
        assert!(roc_auc(&[], &[]).is_none());
    }
}
