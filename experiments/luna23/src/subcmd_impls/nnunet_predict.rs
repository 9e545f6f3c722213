use clap::Args;
use nodule_net::nnunet::{NnUnetCommand, DEFAULT_CONFIGURATION, DEFAULT_PLANS, DEFAULT_PROGRAM};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct NnunetPredict {
    /// nnU-Net 数据集编号 (如 501).
    #[arg(long = "dataset-id", short = 'd')]
    dataset_id: u32,
    /// nnU-Net 工作目录, 其下维护 raw/preprocessed/results 等子目录.
    /// 缺省时用结果根目录下的 `nnunet/`.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,
    /// 输入目录覆盖. 缺省时用 `{workspace}/input`.
    #[arg(long = "input-dir", short = 'i')]
    input_dir: Option<PathBuf>,
    /// 输出目录覆盖. 缺省时用 `{workspace}/output`.
    #[arg(long = "output-dir", short = 'o')]
    output_dir: Option<PathBuf>,
    /// 推理配置名.
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIGURATION)]
    configuration: String,
    /// 参与集成的 fold 序号 (可多次给出).
    #[arg(long = "fold", short = 'f', default_values_t = [0u32])]
    folds: Vec<u32>,
    /// plans 标识.
    #[arg(long, default_value = DEFAULT_PLANS)]
    plans: String,
    /// 推理设备 (cuda / cpu / mps).
    #[arg(long, default_value = "cuda")]
    device: String,
    /// 预测程序可执行名.
    #[arg(long, default_value = DEFAULT_PROGRAM)]
    program: String,
}

impl NnunetPredict {
    pub fn run(&mut self) -> anyhow::Result<()> {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| utils::loader::results_dir_from_env_or_home().join("nnunet"));

        let mut cmd = NnUnetCommand::new(self.dataset_id, workspace)
            .with_program(self.program.clone())
            .with_configuration(self.configuration.clone())
            .with_folds(self.folds.clone())
            .with_plans(self.plans.clone())
            .with_device(self.device.clone());
        if let Some(dir) = &self.input_dir {
            cmd = cmd.with_input_dir(dir.clone());
        }
        if let Some(dir) = &self.output_dir {
            cmd = cmd.with_output_dir(dir.clone());
        }

        cmd.run()?;
        utils::sep();
        println!("nnU-Net predictions -> {}", cmd.output_dir().display());
        utils::sep();
        Ok(())
    }
}
