use anyhow::Context;
use clap::Args;
use ct_cherry::consts::NoduleType;
use ct_cherry::dataset::loader::voi_loader;
use ct_cherry::{save_heat_overlay, MaskSlice, ScanSlice, VoiSpec};
use ndarray::Axis;
use nodule_net::checkpoint::CheckpointManager;
use nodule_net::gradcam::{grad_cam, CamTarget};
use nodule_net::trainer::TrainConfig;
use std::fs;
use std::path::PathBuf;

use super::{fold_dir, TrainBackend};

#[derive(Args, Debug)]
pub struct GradCam {
    /// 实验标识.
    #[arg(long = "exp-id", short = 'e')]
    exp_id: String,
    /// fold 序号, 从 0 计.
    #[arg(long, default_value_t = 0)]
    fold: usize,
    /// 目标 case id.
    #[arg(long, short = 'c')]
    case: String,
    /// 归因目标: `malignancy` 或一个结节类型名 (如 `Solid`).
    #[arg(long, default_value = "malignancy")]
    target: String,
    /// 输出目录. 缺省时写到实验目录下的 `cam/`.
    #[arg(long = "out-dir", short = 'o')]
    out_dir: Option<PathBuf>,
    /// 数据集根目录.
    #[arg(long = "data-dir", short = 'D')]
    data_dir: Option<PathBuf>,
    /// 结果根目录.
    #[arg(long = "results-dir", short = 'R')]
    results_dir: Option<PathBuf>,
}

impl GradCam {
    pub fn run(&mut self) -> anyhow::Result<()> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(utils::loader::data_dir_from_env_or_home);
        let results_dir = self
            .results_dir
            .clone()
            .unwrap_or_else(utils::loader::results_dir_from_env_or_home);
        let exp_dir = fold_dir(&results_dir, &self.exp_id, self.fold);
        let out_dir = self.out_dir.clone().unwrap_or_else(|| exp_dir.join("cam"));

        let target = parse_target(&self.target)?;
        let index = utils::loader::index_from(&data_dir)
            .with_context(|| format!("reading case index under {}", data_dir.display()))?;
        let record = index
            .get(&self.case)
            .with_context(|| format!("unknown case id `{}`", self.case))?
            .clone();

        let config = TrainConfig::load_from(&exp_dir)?;
        let device = Default::default();
        let (model, best) = CheckpointManager::new(&exp_dir, config.network.task())
            .load_best::<TrainBackend>(&config.network, &device)?;
        log::info!(
            "loaded best checkpoint: epoch {}, {} {:.4}",
            best.epoch,
            config.network.task().metric_name(),
            best.metric
        );

        // 单元素迭代器, 必有首项.
        let (_, sample) = voi_loader([record], VoiSpec::standard()).next().unwrap();
        let sample = sample?;
        let cam = grad_cam::<TrainBackend>(&model, &sample, target, &device)?;

        fs::create_dir_all(&out_dir)?;
        let cam_path = out_dir.join(format!("{}-cam.npy", self.case));
        ndarray_npy::write_npy(&cam_path, &cam)?;
        sample.save_npy(&out_dir, &self.case)?;

        let z_mid = sample.shape().0 / 2;
        let scan = ScanSlice::new(sample.image.index_axis(Axis(0), z_mid));
        let mask = sample
            .mask
            .as_ref()
            .map(|m| MaskSlice::new(m.index_axis(Axis(0), z_mid)));
        let overlay_path = out_dir.join(format!("{}-overlay.png", self.case));
        save_heat_overlay(&scan, cam.index_axis(Axis(0), z_mid), mask.as_ref(), &overlay_path)?;

        utils::sep();
        println!("cam volume : {}", cam_path.display());
        println!("overlay    : {}", overlay_path.display());
        utils::sep();
        Ok(())
    }
}

/// 把命令行的归因目标解析为 [`CamTarget`]. 结节类型名不区分大小写.
fn parse_target(raw: &str) -> anyhow::Result<CamTarget> {
    if raw.eq_ignore_ascii_case("malignancy") {
        return Ok(CamTarget::Malignancy);
    }
    if let Some(ty) = NoduleType::from_name(raw) {
        return Ok(CamTarget::NoduleType(ty));
    }
    match NoduleType::ALL
        .into_iter()
        .find(|ty| ty.name().eq_ignore_ascii_case(raw))
    {
        Some(ty) => Ok(CamTarget::NoduleType(ty)),
        None => anyhow::bail!(
            "unknown grad-cam target `{raw}`; use `malignancy` or a nodule type name"
        ),
    }
}
