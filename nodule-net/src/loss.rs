//! 训练损失.
//!
//! 分割用 soft-dice (平滑项 1.0), 结节类型用交叉熵, 恶性二分类用
//! 数值稳定的 BCE-with-logits. 多头模型的总损失为各任务损失之和.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use crate::batch::VoiBatch;
use crate::network::TaskOutputs;

/// soft-dice 的平滑项. 保证 mask 与预测全空时损失为 0 而非 NaN.
pub const DICE_SMOOTH: f64 = 1.0;

/// 分割 dice 损失: `1 - (2I + s) / (P + T + s)`.
///
/// 整个 batch 的体素一并统计, 不做逐样本平均.
pub fn dice_loss<B: Backend>(mask_logits: Tensor<B, 5>, masks: Tensor<B, 5>) -> Tensor<B, 1> {
    let probs = sigmoid(mask_logits);
    let intersection = (probs.clone() * masks.clone()).sum();
    let denom = probs.sum() + masks.sum();
    let dice = intersection
        .mul_scalar(2.0)
        .add_scalar(DICE_SMOOTH)
        .div(denom.add_scalar(DICE_SMOOTH));
    dice.neg().add_scalar(1.0)
}

/// 恶性二分类损失, 对 logit 直接计算:
/// `max(x, 0) - x*t + ln(1 + e^{-|x|})`, 按样本取均值.
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 1>, targets: Tensor<B, 1>) -> Tensor<B, 1> {
    let per_sample = logits.clone().clamp_min(0.0) - logits.clone() * targets
        + logits.abs().neg().exp().add_scalar(1.0).log();
    per_sample.mean()
}

/// 结节类型四分类交叉熵.
pub fn type_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// 汇总一个 batch 上全部在场任务头的损失.
///
/// 各头损失直接相加. 分割头要求 batch 携带 mask; 没有任何
/// (头, 目标) 配对成立时返回 `None`.
pub fn task_loss<B: Backend>(
    outputs: &TaskOutputs<B>,
    batch: &VoiBatch<B>,
) -> Option<Tensor<B, 1>> {
    let mut terms = Vec::new();
    if let (Some(logits), Some(masks)) = (&outputs.mask_logits, &batch.masks) {
        terms.push(dice_loss(logits.clone(), masks.clone()));
    }
    if let Some(logits) = &outputs.type_logits {
        terms.push(type_cross_entropy(logits.clone(), batch.type_targets.clone()));
    }
    if let Some(logits) = &outputs.malig_logits {
        terms.push(bce_with_logits(logits.clone(), batch.malig_targets.clone()));
    }
    terms.into_iter().reduce(|acc, term| acc + term)
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    fn scalar(t: Tensor<TB, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn test_dice_loss_perfect_prediction() {
        let device = Default::default();
        // 前 4 个体素为前景, logits 与 mask 完全一致.
        let logits =
            Tensor::<TB, 1>::from_floats([20.0, 20.0, 20.0, 20.0, -20.0, -20.0, -20.0, -20.0], &device)
                .reshape([1, 1, 2, 2, 2]);
        let masks = Tensor::<TB, 1>::from_floats([1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], &device)
            .reshape([1, 1, 2, 2, 2]);

        // dice = (2*4 + 1) / (4 + 4 + 1) = 1.
        assert!(float_eq(scalar(dice_loss(logits, masks)), 0.0));
    }

    #[test]
    fn test_dice_loss_inverted_prediction() {
        let device = Default::default();
        let logits =
            Tensor::<TB, 1>::from_floats([-20.0, -20.0, -20.0, -20.0, 20.0, 20.0, 20.0, 20.0], &device)
                .reshape([1, 1, 2, 2, 2]);
        let masks = Tensor::<TB, 1>::from_floats([1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], &device)
            .reshape([1, 1, 2, 2, 2]);

        // dice = (0 + 1) / (4 + 4 + 1) = 1/9.
        assert!(float_eq(scalar(dice_loss(logits, masks)), 1.0 - 1.0 / 9.0));
    }

    #[test]
    fn test_dice_loss_both_empty_is_zero() {
        let device = Default::default();
        let logits = Tensor::<TB, 5>::full([1, 1, 2, 2, 2], -20.0, &device);
        let masks = Tensor::<TB, 5>::zeros([1, 1, 2, 2, 2], &device);

        // 平滑项托底: dice = 1/1 = 1, 损失为 0.
        assert!(float_eq(scalar(dice_loss(logits, masks)), 0.0));
    }

    #[test]
    fn test_bce_zero_logit_is_ln_two() {
        let device = Default::default();
        let logits = Tensor::<TB, 1>::zeros([4], &device);
        let targets = Tensor::<TB, 1>::from_floats([0.0, 1.0, 0.0, 1.0], &device);

        assert!(float_eq(scalar(bce_with_logits(logits, targets)), std::f64::consts::LN_2));
    }

    #[test]
    fn test_bce_confident_extremes() {
        let device = Default::default();
        // 正确且确信的预测 -> 损失趋于 0.
        let logits = Tensor::<TB, 1>::from_floats([20.0, -20.0], &device);
        let targets = Tensor::<TB, 1>::from_floats([1.0, 0.0], &device);
        assert!(scalar(bce_with_logits(logits, targets)) < 1e-6);

        // 错误且确信的预测 -> 每样本约 |logit|.
        let logits = Tensor::<TB, 1>::from_floats([-20.0, 20.0], &device);
        let targets = Tensor::<TB, 1>::from_floats([1.0, 0.0], &device);
        assert!(float_eq(scalar(bce_with_logits(logits, targets)), 20.0));
    }

    #[test]
    fn test_type_cross_entropy_prefers_correct_class() {
        let device = Default::default();
        let confident = Tensor::<TB, 2>::from_floats([[10.0, 0.0, 0.0, 0.0]], &device);
        let hesitant = Tensor::<TB, 2>::from_floats([[1.0, 0.0, 0.0, 0.0]], &device);
        let targets = Tensor::<TB, 1, Int>::from_ints([0], &device);

        let lo = scalar(type_cross_entropy(confident, targets.clone()));
        let hi = scalar(type_cross_entropy(hesitant, targets));
        assert!(lo < hi);
    }

    #[test]
    fn test_task_loss_sums_present_heads() {
        let device: <TB as Backend>::Device = Default::default();
        let batch = crate::batch::VoiBatch::<TB> {
            images: Tensor::zeros([2, 1, 2, 2, 2], &device),
            masks: None,
            type_targets: Tensor::from_ints([1, 3], &device),
            malig_targets: Tensor::from_floats([0.0, 1.0], &device),
            case_ids: vec!["a".into(), "b".into()],
        };

        let type_logits = Tensor::<TB, 2>::zeros([2, 4], &device);
        let malig_logits = Tensor::<TB, 1>::zeros([2], &device);

        let both = TaskOutputs {
            mask_logits: None,
            type_logits: Some(type_logits.clone()),
            malig_logits: Some(malig_logits),
        };
        let type_only = TaskOutputs {
            mask_logits: None,
            type_logits: Some(type_logits),
            malig_logits: None,
        };
        let none = TaskOutputs::<TB> {
            mask_logits: None,
            type_logits: None,
            malig_logits: None,
        };

        let both = scalar(task_loss(&both, &batch).unwrap());
        let single = scalar(task_loss(&type_only, &batch).unwrap());
        assert!(float_eq(both, single + std::f64::consts::LN_2));
        assert!(task_loss(&none, &batch).is_none());
    }

    #[test]
    fn test_seg_head_without_masks_contributes_nothing() {
        let device: <TB as Backend>::Device = Default::default();
        let batch = crate::batch::VoiBatch::<TB> {
            images: Tensor::zeros([1, 1, 2, 2, 2], &device),
            masks: None,
            type_targets: Tensor::from_ints([0], &device),
            malig_targets: Tensor::zeros([1], &device),
            case_ids: vec!["a".into()],
        };
        let outputs = TaskOutputs::<TB> {
            mask_logits: Some(Tensor::zeros([1, 1, 2, 2, 2], &device)),
            type_logits: None,
            malig_logits: None,
        };

        assert!(task_loss(&outputs, &batch).is_none());
    }
}
