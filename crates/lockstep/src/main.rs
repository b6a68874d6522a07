use anyhow::Result;
use lockstep::cli::{build_cli, setup::init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let matches = build_cli().get_matches();
    lockstep::cli::handlers::dispatch(&matches).await
}
