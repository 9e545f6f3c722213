//! 网络工厂.
//!
//! [`NetworkSpec`] 是带架构标签的构建参数, 校验后经
//! [`NetworkSpec::init`] 实例化为 [`NoduleModel`]. 三种架构:
//! 编解码 CNN (分割), 编码 CNN + 线性头 (分类), 3D ViT (分类).

mod cnn3d;
mod vit3d;

pub use cnn3d::Cnn3d;
pub use vit3d::Vit3d;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use ct_cherry::consts::VOI_SHAPE;
use ct_cherry::error::{ConfigError, ConfigResult};
use ct_cherry::Idx3d;

use vit3d::VitLayout;

/// 训练/推理任务类别.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// 结节前景分割.
    Segmentation,

    /// 结节类型四分类.
    NoduleType,

    /// 良恶性二分类.
    Malignancy,
}

impl TaskKind {
    /// 任务的规范名称. 实验目录与 checkpoint 文件名以此为前缀.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::Segmentation => "segmentation",
            TaskKind::NoduleType => "noduletype",
            TaskKind::Malignancy => "malignancy",
        }
    }

    /// 该任务模型选择所用验证指标的名称.
    #[inline]
    pub const fn metric_name(self) -> &'static str {
        match self {
            TaskKind::Segmentation => "dice",
            TaskKind::NoduleType => "balanced_accuracy",
            TaskKind::Malignancy => "auc",
        }
    }

    /// 是否是分类任务.
    #[inline]
    pub const fn is_classification(self) -> bool {
        !matches!(self, TaskKind::Segmentation)
    }
}

/// 一次前向产生的各任务头输出. 模型未配置的头为 `None`.
#[derive(Debug, Clone)]
pub struct TaskOutputs<B: Backend> {
    /// 分割头 logits, `[N, 1, z, H, W]`, 与输入体同形.
    pub mask_logits: Option<Tensor<B, 5>>,

    /// 结节类型头 logits, `[N, 4]`.
    pub type_logits: Option<Tensor<B, 2>>,

    /// 恶性头 logit, `[N]`.
    pub malig_logits: Option<Tensor<B, 1>>,
}

/// 分割网络参数. 经 [`SegmentationSpec::new`] 校验后不可变.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentationSpec {
    /// 编码器首层输出通道数, 逐层翻倍.
    base_channels: usize,
}

impl SegmentationSpec {
    /// 构建并校验分割网络参数.
    pub fn new(base_channels: usize) -> ConfigResult<SegmentationSpec> {
        check_base_channels(base_channels)?;
        Ok(Self { base_channels })
    }

    /// 默认配置: 首层 32 通道.
    pub fn standard() -> SegmentationSpec {
        Self::new(32).unwrap()
    }

    /// 重新执行 [`SegmentationSpec::new`] 的全部校验.
    pub fn validate(&self) -> ConfigResult<()> {
        Self::new(self.base_channels).map(drop)
    }

    /// 编码器首层输出通道数.
    #[inline]
    pub fn base_channels(&self) -> usize {
        self.base_channels
    }
}

/// 分类 CNN 参数. 经 [`ClassificationSpec::new`] 校验后不可变.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSpec {
    /// 分类任务 (不允许 [`TaskKind::Segmentation`]).
    task: TaskKind,

    /// 编码器首层输出通道数, 逐层翻倍.
    base_channels: usize,

    /// 分类头隐藏层的 dropout 概率.
    dropout: f64,
}

impl ClassificationSpec {
    /// 构建并校验分类 CNN 参数.
    pub fn new(task: TaskKind, base_channels: usize, dropout: f64) -> ConfigResult<Self> {
        check_classification_task(task)?;
        check_base_channels(base_channels)?;
        check_dropout(dropout)?;
        Ok(Self {
            task,
            base_channels,
            dropout,
        })
    }

    /// 默认配置: 首层 32 通道, 头部 dropout 0.5.
    pub fn standard(task: TaskKind) -> ConfigResult<ClassificationSpec> {
        Self::new(task, 32, 0.5)
    }

    /// 重新执行 [`ClassificationSpec::new`] 的全部校验.
    pub fn validate(&self) -> ConfigResult<()> {
        Self::new(self.task, self.base_channels, self.dropout).map(drop)
    }

    /// 分类任务.
    #[inline]
    pub fn task(&self) -> TaskKind {
        self.task
    }

    /// 编码器首层输出通道数.
    #[inline]
    pub fn base_channels(&self) -> usize {
        self.base_channels
    }

    /// 分类头 dropout 概率.
    #[inline]
    pub fn dropout(&self) -> f64 {
        self.dropout
    }
}

/// 3D ViT 参数. 经 [`VitSpec::new`] 校验后不可变.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitSpec {
    /// 分类任务 (不允许 [`TaskKind::Segmentation`]).
    task: TaskKind,

    /// patch 尺寸 `(z, H, W)`. 必须整除 [`VOI_SHAPE`].
    patch: Idx3d,

    /// token 维度. 必须是 `num_heads` 的正整数倍.
    d_model: usize,

    /// 注意力头数.
    num_heads: usize,

    /// 编码层数.
    num_layers: usize,

    /// 前馈隐藏层维度.
    d_ff: usize,

    /// dropout 概率.
    dropout: f64,
}

impl VitSpec {
    /// 构建并校验 ViT 参数.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: TaskKind,
        patch: Idx3d,
        d_model: usize,
        num_heads: usize,
        num_layers: usize,
        d_ff: usize,
        dropout: f64,
    ) -> ConfigResult<VitSpec> {
        check_classification_task(task)?;
        let (pz, ph, pw) = patch;
        let (vz, vh, vw) = VOI_SHAPE;
        if pz == 0 || ph == 0 || pw == 0 || vz % pz != 0 || vh % ph != 0 || vw % pw != 0 {
            return Err(ConfigError::out_of_range(
                "patch",
                format!("must divide the VOI shape {VOI_SHAPE:?}, got {patch:?}"),
            ));
        }
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(ConfigError::out_of_range(
                "d_model",
                format!("must be a positive multiple of num_heads, got {d_model} with {num_heads} head(s)"),
            ));
        }
        if num_layers == 0 {
            return Err(ConfigError::out_of_range("num_layers", "must be >= 1"));
        }
        if d_ff == 0 {
            return Err(ConfigError::out_of_range("d_ff", "must be >= 1"));
        }
        check_dropout(dropout)?;
        Ok(Self {
            task,
            patch,
            d_model,
            num_heads,
            num_layers,
            d_ff,
            dropout,
        })
    }

    /// 默认配置: patch `(8, 16, 16)` 即 512 个 token,
    /// 嵌入维 256, 8 头 6 层, 前馈 512, dropout 0.1.
    pub fn standard(task: TaskKind) -> ConfigResult<VitSpec> {
        Self::new(task, (8, 16, 16), 256, 8, 6, 512, 0.1)
    }

    /// 重新执行 [`VitSpec::new`] 的全部校验.
    pub fn validate(&self) -> ConfigResult<()> {
        Self::new(
            self.task,
            self.patch,
            self.d_model,
            self.num_heads,
            self.num_layers,
            self.d_ff,
            self.dropout,
        )
        .map(drop)
    }

    /// 分类任务.
    #[inline]
    pub fn task(&self) -> TaskKind {
        self.task
    }

    /// patch 尺寸 `(z, H, W)`.
    #[inline]
    pub fn patch(&self) -> Idx3d {
        self.patch
    }

    /// token 维度.
    #[inline]
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// 注意力头数.
    #[inline]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// 编码层数.
    #[inline]
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// 前馈隐藏层维度.
    #[inline]
    pub fn d_ff(&self) -> usize {
        self.d_ff
    }

    /// dropout 概率.
    #[inline]
    pub fn dropout(&self) -> f64 {
        self.dropout
    }

    /// token 总数, 由 [`VOI_SHAPE`] 与 patch 尺寸导出.
    pub fn num_tokens(&self) -> usize {
        let (pz, ph, pw) = self.patch;
        (VOI_SHAPE.0 / pz) * (VOI_SHAPE.1 / ph) * (VOI_SHAPE.2 / pw)
    }
}

fn check_base_channels(base_channels: usize) -> ConfigResult<()> {
    if !(1..=256).contains(&base_channels) {
        return Err(ConfigError::out_of_range(
            "base_channels",
            format!("must be in [1, 256], got {base_channels}"),
        ));
    }
    Ok(())
}

fn check_dropout(dropout: f64) -> ConfigResult<()> {
    if !(0.0..1.0).contains(&dropout) {
        return Err(ConfigError::out_of_range(
            "dropout",
            format!("must be in [0, 1), got {dropout}"),
        ));
    }
    Ok(())
}

fn check_classification_task(task: TaskKind) -> ConfigResult<()> {
    if !task.is_classification() {
        return Err(ConfigError::out_of_range(
            "task",
            "classification networks require a classification task",
        ));
    }
    Ok(())
}

/// 网络构建参数, 带架构判别标签.
///
/// 序列化为 JSON 时以 `arch` 字段区分变体, 随训练配置一起持久化,
/// 推理端据此重建同构模型.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "arch", rename_all = "lowercase")]
pub enum NetworkSpec {
    /// 编解码 CNN, 分割任务.
    Segmentation(SegmentationSpec),

    /// 编码 CNN + 线性分类头.
    Classification(ClassificationSpec),

    /// 3D ViT, 分类任务.
    Vit(VitSpec),
}

impl NetworkSpec {
    /// 该网络服务的任务.
    pub fn task(&self) -> TaskKind {
        match self {
            NetworkSpec::Segmentation(_) => TaskKind::Segmentation,
            NetworkSpec::Classification(spec) => spec.task(),
            NetworkSpec::Vit(spec) => spec.task(),
        }
    }

    /// 重新执行对应变体构造函数的全部校验.
    /// 面向绕过构造函数得到的实例 (如反序列化结果).
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            NetworkSpec::Segmentation(spec) => spec.validate(),
            NetworkSpec::Classification(spec) => spec.validate(),
            NetworkSpec::Vit(spec) => spec.validate(),
        }
    }

    /// 按参数实例化网络, 权重随机初始化.
    pub fn init<B: Backend>(&self, device: &B::Device) -> NoduleModel<B> {
        match self {
            NetworkSpec::Segmentation(spec) => NoduleModel::Cnn(Cnn3d::new(
                TaskKind::Segmentation,
                spec.base_channels(),
                0.0,
                device,
            )),
            NetworkSpec::Classification(spec) => NoduleModel::Cnn(Cnn3d::new(
                spec.task(),
                spec.base_channels(),
                spec.dropout(),
                device,
            )),
            NetworkSpec::Vit(spec) => NoduleModel::Vit(Vit3d::new(
                &VitLayout {
                    task: spec.task(),
                    patch: spec.patch(),
                    d_model: spec.d_model(),
                    num_heads: spec.num_heads(),
                    num_layers: spec.num_layers(),
                    d_ff: spec.d_ff(),
                    dropout: spec.dropout(),
                    num_tokens: spec.num_tokens(),
                },
                device,
            )),
        }
    }
}

/// 工厂产出的模型. `Module` 派生对枚举逐变体展开,
/// 存档与优化器步进均可直接作用于该类型.
#[derive(Module, Debug)]
pub enum NoduleModel<B: Backend> {
    /// 卷积网络 (分割或分类).
    Cnn(Cnn3d<B>),

    /// 3D ViT (仅分类).
    Vit(Vit3d<B>),
}

impl<B: Backend> NoduleModel<B> {
    /// 完整前向.
    pub fn forward(&self, images: Tensor<B, 5>) -> TaskOutputs<B> {
        match self {
            NoduleModel::Cnn(net) => net.forward(images),
            NoduleModel::Vit(net) => net.forward(images),
        }
    }

    /// 卷积变体视图. Grad-CAM 只对卷积特征图有定义.
    pub fn as_cnn(&self) -> Option<&Cnn3d<B>> {
        match self {
            NoduleModel::Cnn(net) => Some(net),
            NoduleModel::Vit(_) => None,
        }
    }
}
