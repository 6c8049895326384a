use clap::Parser;
use corral_cli::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(corral_cli::run_main(cli))?;
    std::process::exit(code);
}
