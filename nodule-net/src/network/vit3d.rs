//! 3D Vision Transformer 分类网络.
//!
//! 体数据经一次核与步长都等于 patch 尺寸的卷积切成 token 序列,
//! 叠加可学习位置嵌入后过若干自注意力编码层, token 均值池化
//! 进入分类头. 仅支持分类任务.

use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use ct_cherry::consts::NUM_NODULE_TYPES;
use ct_cherry::Idx3d;

use super::{TaskKind, TaskOutputs};

/// 单层编码器: 自注意力 + 前馈, 各带残差与 LayerNorm.
#[derive(Module, Debug)]
struct EncoderBlock<B: Backend> {
    attn: MultiHeadAttention<B>,
    ffn_linear1: Linear<B>,
    ffn_linear2: Linear<B>,
    norm1: LayerNorm<B>,
    norm2: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let attn_out = self.attn.forward(MhaInput::self_attn(x.clone())).context;
        let x = self.norm1.forward(x + self.dropout.forward(attn_out));
        let ffn_out = self
            .ffn_linear2
            .forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm2.forward(x + self.dropout.forward(ffn_out))
    }
}

/// 3D ViT.
#[derive(Module, Debug)]
pub struct Vit3d<B: Backend> {
    patch_embed: Conv3d<B>,
    position_embedding: Embedding<B>,
    layers: Vec<EncoderBlock<B>>,
    final_norm: LayerNorm<B>,
    dropout: Dropout,
    type_head: Option<Linear<B>>,
    malig_head: Option<Linear<B>>,
}

/// [`Vit3d::new`] 的参数集. 上游以 `VitSpec` 校验后传入.
pub(super) struct VitLayout {
    /// 分类任务 (不允许 [`TaskKind::Segmentation`]).
    pub task: TaskKind,

    /// patch 尺寸, `(z, H, W)`. 必须整除输入体尺寸.
    pub patch: Idx3d,

    /// token 维度.
    pub d_model: usize,

    /// 注意力头数.
    pub num_heads: usize,

    /// 编码层数.
    pub num_layers: usize,

    /// 前馈隐藏层维度.
    pub d_ff: usize,

    /// dropout 概率.
    pub dropout: f64,

    /// token 总数 (由体尺寸与 patch 尺寸导出).
    pub num_tokens: usize,
}

impl<B: Backend> Vit3d<B> {
    pub(super) fn new(layout: &VitLayout, device: &B::Device) -> Self {
        let (pz, ph, pw) = layout.patch;
        let patch_embed = Conv3dConfig::new([1, layout.d_model], [pz, ph, pw])
            .with_stride([pz, ph, pw])
            .init(device);
        let position_embedding =
            EmbeddingConfig::new(layout.num_tokens, layout.d_model).init(device);

        let layers = (0..layout.num_layers)
            .map(|_| EncoderBlock {
                attn: MultiHeadAttentionConfig::new(layout.d_model, layout.num_heads)
                    .with_dropout(layout.dropout)
                    .init(device),
                ffn_linear1: LinearConfig::new(layout.d_model, layout.d_ff).init(device),
                ffn_linear2: LinearConfig::new(layout.d_ff, layout.d_model).init(device),
                norm1: LayerNormConfig::new(layout.d_model).init(device),
                norm2: LayerNormConfig::new(layout.d_model).init(device),
                dropout: DropoutConfig::new(layout.dropout).init(),
            })
            .collect();

        let final_norm = LayerNormConfig::new(layout.d_model).init(device);
        let dropout = DropoutConfig::new(layout.dropout).init();
        let type_head = (layout.task == TaskKind::NoduleType)
            .then(|| LinearConfig::new(layout.d_model, NUM_NODULE_TYPES).init(device));
        let malig_head = (layout.task == TaskKind::Malignancy)
            .then(|| LinearConfig::new(layout.d_model, 1).init(device));

        Self {
            patch_embed,
            position_embedding,
            layers,
            final_norm,
            dropout,
            type_head,
            malig_head,
        }
    }

    /// 完整前向.
    pub fn forward(&self, images: Tensor<B, 5>) -> TaskOutputs<B> {
        let [n, _, _, _, _] = images.dims();

        // [N, 1, z, H, W] -> [N, D, z', h', w'] -> [N, T, D].
        let x = self.patch_embed.forward(images);
        let tokens = x.dims()[2..].iter().product::<usize>();
        let x = x.flatten::<3>(2, 4).swap_dims(1, 2);

        // 注意力对 token 顺序不敏感, 位置信息必须显式注入.
        let positions = Tensor::<B, 1, Int>::arange(0..tokens as i64, &x.device())
            .unsqueeze::<2>()
            .expand([n, tokens]);
        let pos = self.position_embedding.forward(positions);

        let mut x = self.dropout.forward(x + pos);
        for layer in &self.layers {
            x = layer.forward(x);
        }
        let x = self.final_norm.forward(x);

        // token 均值池化 -> [N, D].
        let pooled = x.mean_dim(1).squeeze::<2>(1);
        let type_logits = self.type_head.as_ref().map(|h| h.forward(pooled.clone()));
        let malig_logits = self
            .malig_head
            .as_ref()
            .map(|h| h.forward(pooled.clone()).squeeze::<1>(1));
        TaskOutputs {
            mask_logits: None,
            type_logits,
            malig_logits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    fn tiny_layout(task: TaskKind) -> VitLayout {
        VitLayout {
            task,
            patch: (4, 8, 8),
            d_model: 16,
            num_heads: 4,
            num_layers: 2,
            d_ff: 32,
            dropout: 0.0,
            num_tokens: 8,
        }
    }

    #[test]
    fn test_noduletype_shapes() {
        let device = Default::default();
        let net = Vit3d::<TB>::new(&tiny_layout(TaskKind::NoduleType), &device);
        // (8/4) * (16/8) * (16/8) = 8 个 token.
        let images = Tensor::<TB, 5>::zeros([2, 1, 8, 16, 16], &device);

        let outputs = net.forward(images);
        assert!(outputs.mask_logits.is_none());
        assert_eq!(outputs.type_logits.expect("type head").dims(), [2, 4]);
        assert!(outputs.malig_logits.is_none());
    }

    #[test]
    fn test_malignancy_shapes() {
        let device = Default::default();
        let net = Vit3d::<TB>::new(&tiny_layout(TaskKind::Malignancy), &device);
        let images = Tensor::<TB, 5>::zeros([3, 1, 8, 16, 16], &device);

        let outputs = net.forward(images);
        assert_eq!(outputs.malig_logits.expect("malignancy head").dims(), [3]);
    }
}
