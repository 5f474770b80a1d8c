use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::process::Command;
use tokio_postgres::config::{Host, SslMode};

pub const DUMP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("dump command not found: {0}")]
    CommandNotFound(String),
    #[error("dump command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
    #[error("dump command exceeded {0:?}")]
    TimedOut(Duration),
    #[error("invalid database url: {0}")]
    InvalidDatabaseUrl(String),
    #[error("dump io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpArtifact {
    pub file_name: String,
    #[serde(skip)]
    pub contents: Vec<u8>,
}

/// Shells out to an external dump executable (`pg_dump` by default) and hands back
/// what it wrote. Each run gets its own scratch file, removed when the call returns.
///
/// Connection settings reach the child through the libpq `PG*` environment, so the
/// password never shows up in its argument list.
pub struct DumpExporter {
    command: String,
    database_url: String,
    dump_dir: PathBuf,
    timeout: Duration,
}

impl DumpExporter {
    pub fn new(
        command: impl Into<String>,
        database_url: impl Into<String>,
        dump_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            database_url: database_url.into(),
            dump_dir: dump_dir.into(),
            timeout: DUMP_TIMEOUT,
        }
    }

    pub async fn export(&self) -> Result<DumpArtifact, DumpError> {
        let connection = connection_env(&self.database_url)?;
        let file_name = format!("profiles_{}.sql", Utc::now().format("%Y-%m-%d_%H-%M-%S"));
        let scratch = tempfile::Builder::new()
            .prefix("profiles_")
            .suffix(".sql")
            .tempfile_in(&self.dump_dir)
            .map_err(|error| DumpError::Io(error.to_string()))?;
        let stdout = scratch
            .as_file()
            .try_clone()
            .map_err(|error| DumpError::Io(error.to_string()))?;

        let run = Command::new(&self.command)
            .envs(connection)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) if error.kind() == ErrorKind::NotFound => {
                return Err(DumpError::CommandNotFound(self.command.clone()));
            }
            Ok(Err(error)) => return Err(DumpError::Io(error.to_string())),
            Err(_) => return Err(DumpError::TimedOut(self.timeout)),
        };

        if !output.status.success() {
            return Err(DumpError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let contents = tokio::fs::read(scratch.path())
            .await
            .map_err(|error| DumpError::Io(error.to_string()))?;
        Ok(DumpArtifact {
            file_name,
            contents,
        })
    }
}

/// Splits a connection string into the libpq environment variables `pg_dump` reads.
fn connection_env(database_url: &str) -> Result<Vec<(&'static str, String)>, DumpError> {
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|error| DumpError::InvalidDatabaseUrl(error.to_string()))?;

    let mut env = Vec::new();
    let hosts: Vec<String> = config
        .get_hosts()
        .iter()
        .map(|host| match host {
            Host::Tcp(host) => host.clone(),
            #[cfg(unix)]
            Host::Unix(path) => path.display().to_string(),
        })
        .collect();
    if !hosts.is_empty() {
        env.push(("PGHOST", hosts.join(",")));
    }
    let ports: Vec<String> = config.get_ports().iter().map(u16::to_string).collect();
    if !ports.is_empty() {
        env.push(("PGPORT", ports.join(",")));
    }
    if let Some(user) = config.get_user() {
        env.push(("PGUSER", user.to_string()));
    }
    if let Some(password) = config.get_password() {
        env.push(("PGPASSWORD", String::from_utf8_lossy(password).into_owned()));
    }
    if let Some(dbname) = config.get_dbname() {
        env.push(("PGDATABASE", dbname.to_string()));
    }
    let ssl_mode = match config.get_ssl_mode() {
        SslMode::Disable => "disable",
        SslMode::Require => "require",
        _ => "prefer",
    };
    env.push(("PGSSLMODE", ssl_mode.to_string()));
    Ok(env)
}
