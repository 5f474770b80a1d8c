use anyhow::{Result, anyhow};
use clap::Parser;
use profile_service::{db::ProfileDb, init_tracing};

#[derive(Parser, Debug)]
#[command(about = "Create or update the profiles table")]
struct Args {
    /// Postgres connection string. Falls back to DB_URL, then DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let database_url = args
        .database_url
        .or_else(|| std::env::var("DB_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("--database-url, DB_URL or DATABASE_URL is required"))?;

    let db = ProfileDb::connect(&database_url).await?;
    db.ensure_schema().await?;
    tracing::info!("profile migrations complete");
    Ok(())
}
