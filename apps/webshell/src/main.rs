use anyhow::Context;
use clap::Parser;
use webshell_core::app;
use webshell_core::cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    app::run(cli).await.context("webshell")?;
    Ok(())
}
