use anyhow::Result;
use treport::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run_cli().await
}
