use anyhow::Result;
use profile_service::{config::Config, init_tracing, serve};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    serve(config).await
}
