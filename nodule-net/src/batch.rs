//! VOI 样本的数据集适配与张量打包.
//!
//! [`VoiDataset`] 把 case 记录接到 burn 的 `Dataset` 抽象上:
//! 每次取样从磁盘读取 nii 对并裁出 VOI, 训练侧可选地按
//! (实验种子, epoch, 样本序号) 派生的种子做确定性增广.
//! [`VoiBatcher`] 再把一组样本堆叠为 `[N, 1, z, H, W]` 张量.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use ndarray::Array3;

use ct_cherry::augment::{sample_seed, Augmenter};
use ct_cherry::dataset::CaseRecord;
use ct_cherry::error::DataResult;
use ct_cherry::{VoiSample, VoiSpec, VolumePair};

/// 单个训练样本: VOI 图像、可选掩膜与两类标签.
#[derive(Debug, Clone)]
pub struct VoiItem {
    /// case id.
    pub case_id: String,

    /// 归一化后的 VOI 图像, `(z, H, W)`.
    pub image: Array3<f32>,

    /// 二值结节掩膜, 与 `image` 同形状.
    pub mask: Option<Array3<u8>>,

    /// 结节类型编码, `0..4`.
    pub nodule_type: usize,

    /// 恶性程度, `0` 或 `1`.
    pub malignancy: u8,
}

/// 懒加载的 VOI 数据集.
///
/// `get` 每次从磁盘重新读取并裁剪, 不在内存里缓存体数据.
/// 多个 epoch 之间通过 [`VoiDataset::epoch_handle`] 共享的计数器
/// 推进增广种子.
#[derive(Debug)]
pub struct VoiDataset {
    records: Vec<CaseRecord>,
    spec: VoiSpec,
    augmenter: Option<Augmenter>,
    base_seed: u64,
    epoch: Arc<AtomicU64>,
}

impl VoiDataset {
    /// 不带增广的数据集 (验证/推理侧).
    pub fn new(records: Vec<CaseRecord>, spec: VoiSpec) -> VoiDataset {
        Self {
            records,
            spec,
            augmenter: None,
            base_seed: 0,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 带确定性增广的数据集 (训练侧).
    pub fn with_augment(
        records: Vec<CaseRecord>,
        spec: VoiSpec,
        augmenter: Augmenter,
        base_seed: u64,
    ) -> VoiDataset {
        Self {
            records,
            spec,
            augmenter: Some(augmenter),
            base_seed,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// epoch 计数器句柄. 数据集移交给 dataloader 后,
    /// 训练循环通过该句柄在每个 epoch 开始时调用
    /// [`AtomicU64::store`] 推进增广种子.
    pub fn epoch_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    /// 样本对应的 case 记录.
    pub fn records(&self) -> &[CaseRecord] {
        &self.records
    }

    fn load_item(&self, index: usize) -> DataResult<VoiItem> {
        let case = &self.records[index];
        let pair = VolumePair::open(case.image_path(), case.mask_path())?;
        let mut sample = self.spec.extract(&pair, case.center());

        if let Some(augmenter) = &self.augmenter {
            let epoch = self.epoch.load(Ordering::Relaxed);
            let seed = sample_seed(self.base_seed, epoch, index as u64);
            augmenter.apply(&mut sample, seed);
        }

        let VoiSample { image, mask } = sample;
        Ok(VoiItem {
            case_id: case.case_id().to_owned(),
            image,
            mask,
            nodule_type: case.nodule_type().index(),
            malignancy: case.malignancy().index() as u8,
        })
    }
}

impl Dataset<VoiItem> for VoiDataset {
    /// 取第 `index` 个样本.
    ///
    /// # Panics
    ///
    /// 底层文件读取失败时 panic. 训练入口在开训前审计过全部文件,
    /// 此处的失败属于非期望情况.
    fn get(&self, index: usize) -> Option<VoiItem> {
        if index >= self.records.len() {
            return None;
        }
        match self.load_item(index) {
            Ok(item) => Some(item),
            Err(e) => panic!(
                "failed to load case `{}`: {e}",
                self.records[index].case_id()
            ),
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// 一个 mini-batch 的张量视图.
#[derive(Debug, Clone)]
pub struct VoiBatch<B: Backend> {
    /// `[N, 1, z, H, W]` 的归一化图像.
    pub images: Tensor<B, 5>,

    /// `[N, 1, z, H, W]` 的 0/1 掩膜. 任一样本缺掩膜时为 `None`.
    pub masks: Option<Tensor<B, 5>>,

    /// `[N]` 的结节类型标签.
    pub type_targets: Tensor<B, 1, Int>,

    /// `[N]` 的恶性程度标签 (0.0 / 1.0).
    pub malig_targets: Tensor<B, 1>,

    /// 批内各样本的 case id, 与张量行序一致.
    pub case_ids: Vec<String>,
}

/// 把 `Vec<VoiItem>` 堆叠成 [`VoiBatch`] 的 batcher.
#[derive(Clone, Debug)]
pub struct VoiBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VoiBatcher<B> {
    /// 在给定设备上创建张量的 batcher.
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<VoiItem, VoiBatch<B>> for VoiBatcher<B> {
    fn batch(&self, items: Vec<VoiItem>) -> VoiBatch<B> {
        let n = items.len();
        let (z, h, w) = items[0].image.dim();

        let mut image_flat: Vec<f32> = Vec::with_capacity(n * z * h * w);
        for item in &items {
            image_flat.extend(item.image.iter().copied());
        }
        let images = Tensor::<B, 1>::from_floats(image_flat.as_slice(), &self.device)
            .reshape([n, 1, z, h, w]);

        let masks = if items.iter().all(|item| item.mask.is_some()) {
            let mut mask_flat: Vec<f32> = Vec::with_capacity(n * z * h * w);
            for item in &items {
                // all() 判定保证这里的 unwrap 不会触发.
                mask_flat.extend(item.mask.as_ref().unwrap().iter().map(|&v| f32::from(v)));
            }
            Some(
                Tensor::<B, 1>::from_floats(mask_flat.as_slice(), &self.device)
                    .reshape([n, 1, z, h, w]),
            )
        } else {
            None
        };

        let types: Vec<i32> = items.iter().map(|item| item.nodule_type as i32).collect();
        let type_targets = Tensor::<B, 1, Int>::from_ints(types.as_slice(), &self.device);

        let maligs: Vec<f32> = items.iter().map(|item| f32::from(item.malignancy)).collect();
        let malig_targets = Tensor::<B, 1>::from_floats(maligs.as_slice(), &self.device);

        let case_ids = items.into_iter().map(|item| item.case_id).collect();

        VoiBatch {
            images,
            masks,
            type_targets,
            malig_targets,
            case_ids,
        }
    }
}
