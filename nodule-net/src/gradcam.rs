//! 分类决策的 Grad-CAM 热力图.
//!
//! 把编码器瓶颈特征重新标记为梯度叶子, 从目标类得分反传,
//! 以各通道梯度的空间均值为权重对特征图做加权 ReLU 组合,
//! 再最近邻放大回输入 VOI 的形状. 热力图归一化到 `[0, 1]`.
//!
//! 该拆分依赖卷积网络的 [`Cnn3d::encode`] / [`Cnn3d::classify_from`]
//! 两段式前向; transformer 网络没有空间特征金字塔, 不支持.

use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array3;

use ct_cherry::consts::NoduleType;
use ct_cherry::VoiSample;

use crate::error::{InferError, InferResult};
use crate::infer::sample_tensor;
use crate::network::NoduleModel;

#[cfg(doc)]
use crate::network::Cnn3d;

/// 反传起点: 热力图解释哪个输出得分.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamTarget {
    /// 结节类型头上某一类的 logit.
    NoduleType(NoduleType),

    /// 恶性程度头的 logit.
    Malignancy,
}

/// 计算 `sample` 在 `target` 得分上的 Grad-CAM 体.
///
/// 返回与 `sample` 同形状的热力图. 模型不是卷积网络时返回
/// [`InferError::CamUnsupported`]; 模型没有目标任务的输出头时
/// 返回 [`InferError::MissingHead`].
pub fn grad_cam<B: AutodiffBackend>(
    model: &NoduleModel<B>,
    sample: &VoiSample,
    target: CamTarget,
    device: &B::Device,
) -> InferResult<Array3<f32>> {
    let cnn = model.as_cnn().ok_or(InferError::CamUnsupported)?;

    let (bottleneck, _) = cnn.encode(sample_tensor(sample, device));
    // 截断上游计算图, 让瓶颈特征成为本次反传的叶子.
    let features = bottleneck.detach().require_grad();
    let outputs = cnn.classify_from(features.clone());

    let score: Tensor<B, 1> = match target {
        CamTarget::NoduleType(t) => {
            let logits = outputs
                .type_logits
                .ok_or(InferError::MissingHead("noduletype"))?;
            let idx = t.index();
            logits.slice([0..1, idx..idx + 1]).sum()
        }
        CamTarget::Malignancy => outputs
            .malig_logits
            .ok_or(InferError::MissingHead("malignancy"))?
            .sum(),
    };

    let grads = score.backward();
    let grad = features.grad(&grads).ok_or(InferError::NoGradient)?;
    let [_, c, dz, dh, dw] = grad.dims();

    // 通道权重 = 梯度的空间均值; 加权求和后保留正贡献.
    let weights = grad.flatten::<3>(2, 4).mean_dim(2).reshape([1, c, 1, 1, 1]);
    let combined = relu((features.inner() * weights).sum_dim(1));

    let flat: Vec<f32> = combined.into_data().iter::<f32>().collect();
    // 长度与形状由上面的求和输出保证一致.
    let mut cam = Array3::from_shape_vec((dz, dh, dw), flat).unwrap();
    let peak = cam.iter().cloned().fold(0.0f32, f32::max);
    if peak > 0.0 {
        cam.mapv_inplace(|v| v / peak);
    }

    Ok(upsample_nearest(&cam, sample.shape()))
}

/// 最近邻放大到 `target` 形状.
fn upsample_nearest(coarse: &Array3<f32>, target: (usize, usize, usize)) -> Array3<f32> {
    let (sz, sh, sw) = coarse.dim();
    let (tz, th, tw) = target;
    Array3::from_shape_fn((tz, th, tw), |(i, j, k)| {
        coarse[(i * sz / tz, j * sh / th, k * sw / tw)]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ClassificationSpec, NetworkSpec, TaskKind, VitSpec};
    use ndarray::Array3;

    type TB = burn::backend::Autodiff<burn::backend::NdArray>;

    fn fake_sample(dim: usize) -> VoiSample {
        let mut image = Array3::from_elem((dim, dim, dim), 0.2);
        image[(dim / 2, dim / 2, dim / 2)] = 1.0;
        VoiSample { image, mask: None }
    }

    fn cnn_model(task: TaskKind) -> NoduleModel<TB> {
        let device = Default::default();
        NetworkSpec::Classification(ClassificationSpec::new(task, 2, 0.0).unwrap())
            .init(&device)
    }

    #[test]
    fn test_cam_shape_and_range() {
        let device = Default::default();
        let model = cnn_model(TaskKind::Malignancy);
        let sample = fake_sample(16);

        let cam = grad_cam(&model, &sample, CamTarget::Malignancy, &device).unwrap();
        assert_eq!(cam.dim(), (16, 16, 16));
        assert!(cam.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_cam_type_target() {
        let device = Default::default();
        let model = cnn_model(TaskKind::NoduleType);
        let sample = fake_sample(16);

        let cam = grad_cam(
            &model,
            &sample,
            CamTarget::NoduleType(NoduleType::Solid),
            &device,
        )
        .unwrap();
        assert_eq!(cam.dim(), sample.shape());
    }

    #[test]
    fn test_cam_rejects_head_mismatch() {
        let device = Default::default();
        let model = cnn_model(TaskKind::Malignancy);
        let sample = fake_sample(16);

        let err = grad_cam(
            &model,
            &sample,
            CamTarget::NoduleType(NoduleType::Solid),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, InferError::MissingHead("noduletype")));
    }

    #[test]
    fn test_cam_rejects_transformer() {
        let device = Default::default();
        let spec = VitSpec::new(TaskKind::Malignancy, (16, 32, 32), 16, 4, 1, 32, 0.0).unwrap();
        let model: NoduleModel<TB> = NetworkSpec::Vit(spec).init(&device);
        let sample = fake_sample(16);

        let err = grad_cam(&model, &sample, CamTarget::Malignancy, &device).unwrap_err();
        assert!(matches!(err, InferError::CamUnsupported));
    }

    #[test]
    fn test_upsample_nearest_blocks() {
        let coarse = Array3::from_shape_fn((1, 2, 2), |(_, j, k)| (j * 2 + k) as f32);
        let fine = upsample_nearest(&coarse, (2, 4, 4));
        assert_eq!(fine.dim(), (2, 4, 4));
        // 每个粗体素扩成 2x2x2 块.
        assert_eq!(fine[(0, 0, 0)], 0.0);
        assert_eq!(fine[(1, 0, 1)], 0.0);
        assert_eq!(fine[(0, 0, 2)], 1.0);
        assert_eq!(fine[(1, 3, 3)], 3.0);
        assert_eq!(fine[(0, 2, 1)], 2.0);
    }
}
