use clap::Parser;
use luna23::Cli;

fn main() -> anyhow::Result<()> {
    utils::init_logger();
    let mut cmd: Cli = Cli::parse();
    cmd.run_program()
}
