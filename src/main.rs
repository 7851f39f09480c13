use clap::Parser;
use mgit::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mgit=info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = cli::run(cli).await;
    std::process::exit(code);
}
