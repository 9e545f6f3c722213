//! 外部 nnU-Net 推理命令的薄封装.
//!
//! 本 crate 不实现 nnU-Net 的任何内部逻辑, 只负责三件事:
//! 组装命令行参数, 通过环境变量指定 raw/preprocessed/results
//! 三个工作目录, 以及把子进程的退出状态映射为
//! [`ExternalToolError`]. 失败不重试.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ExternalToolError, ToolResult};

/// 缺省推理可执行文件名.
pub const DEFAULT_PROGRAM: &str = "nnUNetv2_predict";

/// 缺省网络配置名.
pub const DEFAULT_CONFIGURATION: &str = "3d_fullres";

/// 缺省 plans 标识.
pub const DEFAULT_PLANS: &str = "nnUNetPlans";

/// 一次 nnU-Net 推理调用的全部参数.
#[derive(Debug, Clone)]
pub struct NnUnetCommand {
    program: String,
    raw_dir: PathBuf,
    preprocessed_dir: PathBuf,
    results_dir: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
    dataset_id: u32,
    configuration: String,
    folds: Vec<u32>,
    plans: String,
    device: String,
}

impl NnUnetCommand {
    /// 以 `workspace` 为根组装缺省参数.
    ///
    /// 三个环境目录与输入/输出目录都挂在 `workspace` 下;
    /// 需要别的布局时用 `with_*` 逐项覆盖.
    pub fn new(dataset_id: u32, workspace: impl Into<PathBuf>) -> NnUnetCommand {
        let workspace = workspace.into();
        Self {
            program: DEFAULT_PROGRAM.to_owned(),
            raw_dir: workspace.join("nnUNet_raw"),
            preprocessed_dir: workspace.join("nnUNet_preprocessed"),
            results_dir: workspace.join("nnUNet_results"),
            input_dir: workspace.join("input"),
            output_dir: workspace.join("output"),
            dataset_id,
            configuration: DEFAULT_CONFIGURATION.to_owned(),
            folds: vec![0],
            plans: DEFAULT_PLANS.to_owned(),
            device: "cuda".to_owned(),
        }
    }

    /// 覆盖可执行文件 (名称或路径).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// 覆盖待推理 case 所在目录.
    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    /// 覆盖预测结果输出目录.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// 覆盖网络配置名 (如 `3d_fullres` / `2d`).
    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = configuration.into();
        self
    }

    /// 覆盖参与集成的折编号.
    pub fn with_folds(mut self, folds: Vec<u32>) -> Self {
        self.folds = folds;
        self
    }

    /// 覆盖 plans 标识.
    pub fn with_plans(mut self, plans: impl Into<String>) -> Self {
        self.plans = plans.into();
        self
    }

    /// 覆盖推理设备 (如 `cuda` / `cpu`).
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// 目标可执行文件.
    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// 预测结果输出目录.
    #[inline]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 创建全部工作目录. 已存在的目录不报错.
    pub fn scaffold(&self) -> ToolResult<()> {
        for dir in [
            &self.raw_dir,
            &self.preprocessed_dir,
            &self.results_dir,
            &self.input_dir,
            &self.output_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// 组装未启动的子进程命令.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-i")
            .arg(&self.input_dir)
            .arg("-o")
            .arg(&self.output_dir)
            .arg("-d")
            .arg(self.dataset_id.to_string())
            .arg("-c")
            .arg(&self.configuration)
            .arg("-p")
            .arg(&self.plans)
            .arg("-device")
            .arg(&self.device);
        cmd.arg("-f");
        for fold in &self.folds {
            cmd.arg(fold.to_string());
        }
        cmd.env("nnUNet_raw", &self.raw_dir)
            .env("nnUNet_preprocessed", &self.preprocessed_dir)
            .env("nnUNet_results", &self.results_dir);
        cmd
    }

    /// 创建工作目录并同步运行命令, 等待其退出.
    ///
    /// 启动失败映射为 [`ExternalToolError::Launch`]; 非零退出
    /// 映射为 [`ExternalToolError::NonZeroExit`] 并附带 stderr 尾部.
    pub fn run(&self) -> ToolResult<()> {
        self.scaffold()?;
        log::info!(
            "launching `{}`: dataset {}, configuration {}, fold(s) {:?}",
            self.program,
            self.dataset_id,
            self.configuration,
            self.folds,
        );

        let output = self
            .command()
            .output()
            .map_err(|source| ExternalToolError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ExternalToolError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        log::info!("`{}` finished, results in {:?}", self.program, self.output_dir);
        Ok(())
    }
}

/// stderr 的最后几行. 错误信息几乎总在尾部.
fn stderr_tail(raw: &[u8]) -> String {
    const KEEP_LINES: usize = 8;
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(KEEP_LINES)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_command_assembly() {
        let cmd = NnUnetCommand::new(23, "/tmp/nnunet")
            .with_configuration("2d")
            .with_folds(vec![0, 1, 4])
            .with_device("cpu");
        let command = cmd.command();

        assert_eq!(command.get_program(), DEFAULT_PROGRAM);
        let args: Vec<&OsStr> = command.get_args().collect();
        assert!(args.windows(2).any(|w| w == [OsStr::new("-d"), OsStr::new("23")]));
        assert!(args.windows(2).any(|w| w == [OsStr::new("-c"), OsStr::new("2d")]));
        assert!(args.windows(4).any(|w| {
            w == [OsStr::new("-f"), OsStr::new("0"), OsStr::new("1"), OsStr::new("4")]
        }));

        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| *k == OsStr::new("nnUNet_raw")
                && *v == Some(OsStr::new("/tmp/nnunet/nnUNet_raw"))));
        assert!(envs.iter().any(|(k, _)| *k == OsStr::new("nnUNet_results")));
    }

    #[test]
    fn test_scaffold_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = NnUnetCommand::new(1, dir.path());
        cmd.scaffold().unwrap();

        for sub in [
            "nnUNet_raw",
            "nnUNet_preprocessed",
            "nnUNet_results",
            "input",
            "output",
        ] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        // 重复 scaffold 幂等.
        cmd.scaffold().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_run_success() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = NnUnetCommand::new(1, dir.path()).with_program("/bin/true");
        cmd.run().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_run_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = NnUnetCommand::new(1, dir.path()).with_program("/bin/false");
        let err = cmd.run().unwrap_err();
        assert!(matches!(
            err,
            ExternalToolError::NonZeroExit { code: Some(1), .. }
        ));
    }

    #[test]
    fn test_run_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = NnUnetCommand::new(1, dir.path())
            .with_program("nnunet-binary-that-does-not-exist");
        let err = cmd.run().unwrap_err();
        match err {
            ExternalToolError::Launch { program, .. } => {
                assert_eq!(program, "nnunet-binary-that-does-not-exist");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let long: String = (0..20).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
        assert_eq!(stderr_tail(b""), "");
    }
}
