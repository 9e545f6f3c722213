use anyhow::Context;
use clap::Args;
use nodule_net::trainer::{EpochMetrics, METRICS_FILE};
use std::path::{Path, PathBuf};

use super::fold_dir;

#[derive(Args, Debug)]
pub struct Curves {
    /// 实验标识.
    #[arg(long = "exp-id", short = 'e')]
    exp_id: String,
    /// fold 序号, 从 0 计.
    #[arg(long, default_value_t = 0)]
    fold: usize,
    /// 输出 PNG 路径. 缺省时写到实验目录下的 `curves.png`.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
    /// 结果根目录.
    #[arg(long = "results-dir", short = 'R')]
    results_dir: Option<PathBuf>,
}

impl Curves {
    pub fn run(&mut self) -> anyhow::Result<()> {
        let results_dir = self
            .results_dir
            .clone()
            .unwrap_or_else(utils::loader::results_dir_from_env_or_home);
        let exp_dir = fold_dir(&results_dir, &self.exp_id, self.fold);
        let metrics_path = exp_dir.join(METRICS_FILE);

        let history = EpochMetrics::load_history(&metrics_path)
            .with_context(|| format!("reading {}", metrics_path.display()))?;
        anyhow::ensure!(!history.is_empty(), "{} has no rows", metrics_path.display());

        let out = self.out.clone().unwrap_or_else(|| exp_dir.join("curves.png"));
        render_curves(&history, &out)?;
        log::info!("curves rendered to {}", out.display());
        Ok(())
    }
}

/// 左半幅画损失曲线 (train/valid), 右半幅画模型选择指标,
/// 触发 checkpoint 的 epoch 以实心圆标出.
fn render_curves(history: &[EpochMetrics], out: &Path) -> anyhow::Result<()> {
    use plotters::prelude::*;

    let root = BitMapBackend::new(out, (1280, 540)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((1, 2));

    // 调用方已确认非空.
    let last_epoch = history.iter().map(|r| r.epoch).max().unwrap() as i32;
    let max_loss = history
        .iter()
        .map(|r| r.train_loss.max(r.valid_loss))
        .fold(f64::EPSILON, f64::max);

    let mut loss_chart = ChartBuilder::on(&panels[0])
        .caption("loss", ("sans-serif", 22))
        .margin(8)
        .x_label_area_size(32)
        .y_label_area_size(48)
        .build_cartesian_2d(0i32..last_epoch.max(1), 0f64..max_loss * 1.05)?;
    loss_chart.configure_mesh().x_desc("epoch").draw()?;

    loss_chart
        .draw_series(LineSeries::new(
            history.iter().map(|r| (r.epoch as i32, r.train_loss)),
            &RED,
        ))?
        .label("train")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], RED));
    loss_chart
        .draw_series(LineSeries::new(
            history.iter().map(|r| (r.epoch as i32, r.valid_loss)),
            &BLUE,
        ))?
        .label("valid")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLUE));
    loss_chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    let metric_name = history[0].metric_name.as_str();
    let mut metric_chart = ChartBuilder::on(&panels[1])
        .caption(metric_name, ("sans-serif", 22))
        .margin(8)
        .x_label_area_size(32)
        .y_label_area_size(48)
        .build_cartesian_2d(0i32..last_epoch.max(1), 0f64..1f64)?;
    metric_chart.configure_mesh().x_desc("epoch").draw()?;

    metric_chart.draw_series(LineSeries::new(
        history
            .iter()
            .filter_map(|r| r.metric.map(|m| (r.epoch as i32, m))),
        &BLUE,
    ))?;
    metric_chart.draw_series(
        history
            .iter()
            .filter(|r| r.improved)
            .filter_map(|r| r.metric.map(|m| (r.epoch as i32, m)))
            .map(|xy| Circle::new(xy, 3, GREEN.filled())),
    )?;

    root.present()?;
    Ok(())
}
