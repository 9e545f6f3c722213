//! 3D 卷积网络.
//!
//! 编码器为四级步长为 2 的卷积金字塔 (通道 c, 2c, 4c, 8c, 16c);
//! 分割任务在其上接带跳连的转置卷积解码器, 分类任务接全局平均
//! 池化后的两层全连接头. 输入要求三个空间维都能被 16 整除.

use burn::nn::conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig3d,
};
use burn::prelude::*;
use burn::tensor::activation::relu;

use ct_cherry::consts::NUM_NODULE_TYPES;

use super::{TaskKind, TaskOutputs};

/// 编码器级数. 输入空间尺寸被压缩 `2^DOWN_LEVELS` 倍.
pub const DOWN_LEVELS: usize = 4;

/// `3x3x3` 卷积 + BatchNorm + ReLU.
#[derive(Module, Debug)]
struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    norm: BatchNorm<B, 3>,
}

impl<B: Backend> ConvBlock<B> {
    fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

fn conv_block<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    stride: usize,
    device: &B::Device,
) -> ConvBlock<B> {
    let conv = Conv3dConfig::new([in_ch, out_ch], [3, 3, 3])
        .with_stride([stride, stride, stride])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .init(device);
    let norm = BatchNormConfig::new(out_ch).init(device);
    ConvBlock { conv, norm }
}

/// 一级下采样: 步长 2 的压缩卷积接一个精化卷积.
#[derive(Module, Debug)]
struct DownBlock<B: Backend> {
    reduce: ConvBlock<B>,
    refine: ConvBlock<B>,
}

impl<B: Backend> DownBlock<B> {
    fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        self.refine.forward(self.reduce.forward(x))
    }
}

/// 一级上采样: 转置卷积放大两倍, 与同级跳连拼接后精化.
#[derive(Module, Debug)]
struct UpBlock<B: Backend> {
    up: ConvTranspose3d<B>,
    refine: ConvBlock<B>,
}

impl<B: Backend> UpBlock<B> {
    fn forward(&self, x: Tensor<B, 5>, skip: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.up.forward(x);
        self.refine.forward(Tensor::cat(vec![x, skip], 1))
    }
}

/// 分割解码器. 输出单通道 logit 体.
#[derive(Module, Debug)]
struct Decoder3d<B: Backend> {
    ups: Vec<UpBlock<B>>,
    head: Conv3d<B>,
}

impl<B: Backend> Decoder3d<B> {
    /// `skips` 自深到浅排列, 与 `ups` 一一对应.
    fn forward(&self, bottleneck: Tensor<B, 5>, skips: &[Tensor<B, 5>]) -> Tensor<B, 5> {
        let mut x = bottleneck;
        for (up, skip) in self.ups.iter().zip(skips) {
            x = up.forward(x, skip.clone());
        }
        self.head.forward(x)
    }
}

/// 全局平均池化后的两层分类头.
#[derive(Module, Debug)]
struct ClsHead<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    out: Linear<B>,
}

impl<B: Backend> ClsHead<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.out
            .forward(self.dropout.forward(relu(self.hidden.forward(x))))
    }
}

fn cls_head<B: Backend>(
    in_features: usize,
    out_features: usize,
    dropout: f64,
    device: &B::Device,
) -> ClsHead<B> {
    ClsHead {
        hidden: LinearConfig::new(in_features, in_features / 4).init(device),
        dropout: DropoutConfig::new(dropout).init(),
        out: LinearConfig::new(in_features / 4, out_features).init(device),
    }
}

/// `[N, C, z, H, W]` -> `[N, C]` 的全局平均池化.
fn global_avg_pool<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 2> {
    let [n, c, _, _, _] = x.dims();
    x.flatten::<3>(2, 4).mean_dim(2).reshape([n, c])
}

/// 单任务 3D CNN.
///
/// 按任务装配: 分割任务持有解码器, 分类任务持有对应的全连接头.
#[derive(Module, Debug)]
pub struct Cnn3d<B: Backend> {
    stem: ConvBlock<B>,
    down: Vec<DownBlock<B>>,
    decoder: Option<Decoder3d<B>>,
    type_head: Option<ClsHead<B>>,
    malig_head: Option<ClsHead<B>>,
}

impl<B: Backend> Cnn3d<B> {
    /// 按任务构建网络. `base_channels` 为金字塔首级通道数.
    pub fn new(task: TaskKind, base_channels: usize, dropout: f64, device: &B::Device) -> Self {
        let chans: Vec<usize> = (0..=DOWN_LEVELS).map(|i| base_channels << i).collect();

        let stem = conv_block(1, chans[0], 1, device);
        let down = (0..DOWN_LEVELS)
            .map(|i| DownBlock {
                reduce: conv_block(chans[i], chans[i + 1], 2, device),
                refine: conv_block(chans[i + 1], chans[i + 1], 1, device),
            })
            .collect();

        let decoder = (task == TaskKind::Segmentation).then(|| Decoder3d {
            ups: (0..DOWN_LEVELS)
                .rev()
                .map(|i| UpBlock {
                    up: ConvTranspose3dConfig::new([chans[i + 1], chans[i]], [2, 2, 2])
                        .with_stride([2, 2, 2])
                        .init(device),
                    refine: conv_block(2 * chans[i], chans[i], 1, device),
                })
                .collect(),
            head: Conv3dConfig::new([chans[0], 1], [1, 1, 1]).init(device),
        });

        let deep = chans[DOWN_LEVELS];
        let type_head = (task == TaskKind::NoduleType)
            .then(|| cls_head(deep, NUM_NODULE_TYPES, dropout, device));
        let malig_head =
            (task == TaskKind::Malignancy).then(|| cls_head(deep, 1, dropout, device));

        Self {
            stem,
            down,
            decoder,
            type_head,
            malig_head,
        }
    }

    /// 编码. 返回 (瓶颈特征, 自深到浅的跳连特征).
    pub fn encode(&self, images: Tensor<B, 5>) -> (Tensor<B, 5>, Vec<Tensor<B, 5>>) {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut x = self.stem.forward(images);
        for block in &self.down {
            skips.push(x.clone());
            x = block.forward(x);
        }
        skips.reverse();
        (x, skips)
    }

    /// 仅运行分类头 (瓶颈特征已给出). Grad-CAM 依赖该拆分点.
    pub fn classify_from(&self, bottleneck: Tensor<B, 5>) -> TaskOutputs<B> {
        let pooled = global_avg_pool(bottleneck);
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

    /// 完整前向.
    pub fn forward(&self, images: Tensor<B, 5>) -> TaskOutputs<B> {
        let (bottleneck, skips) = self.encode(images);
        let mask_logits = self
            .decoder
            .as_ref()
            .map(|d| d.forward(bottleneck.clone(), &skips));
        TaskOutputs {
            mask_logits,
            ..self.classify_from(bottleneck)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    #[test]
    fn test_segmentation_shapes() {
        let device = Default::default();
        let net = Cnn3d::<TB>::new(TaskKind::Segmentation, 2, 0.0, &device);
        let images = Tensor::<TB, 5>::zeros([2, 1, 16, 16, 16], &device);

        let outputs = net.forward(images);
        let mask_logits = outputs.mask_logits.expect("segmentation head");
        assert_eq!(mask_logits.dims(), [2, 1, 16, 16, 16]);
        assert!(outputs.type_logits.is_none());
        assert!(outputs.malig_logits.is_none());
    }

    #[test]
    fn test_noduletype_shapes() {
        let device = Default::default();
        let net = Cnn3d::<TB>::new(TaskKind::NoduleType, 2, 0.1, &device);
        let images = Tensor::<TB, 5>::zeros([3, 1, 16, 16, 16], &device);

        let outputs = net.forward(images);
        assert!(outputs.mask_logits.is_none());
        assert_eq!(outputs.type_logits.expect("type head").dims(), [3, 4]);
    }

    #[test]
    fn test_malignancy_shapes() {
        let device = Default::default();
        let net = Cnn3d::<TB>::new(TaskKind::Malignancy, 2, 0.1, &device);
        let images = Tensor::<TB, 5>::zeros([2, 1, 16, 16, 16], &device);

        let outputs = net.forward(images);
        assert_eq!(outputs.malig_logits.expect("malignancy head").dims(), [2]);
    }

    #[test]
    fn test_encoder_pyramid() {
        let device = Default::default();
        let net = Cnn3d::<TB>::new(TaskKind::Malignancy, 2, 0.0, &device);
        let images = Tensor::<TB, 5>::zeros([1, 1, 16, 32, 32], &device);

        let (bottleneck, skips) = net.encode(images);
        assert_eq!(bottleneck.dims(), [1, 32, 1, 2, 2]);
        assert_eq!(skips.len(), DOWN_LEVELS);
        // 跳连自深到浅.
        assert_eq!(skips[0].dims(), [1, 16, 2, 4, 4]);
        assert_eq!(skips[3].dims(), [1, 2, 16, 32, 32]);
    }
}
