use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Idempotent schema for the profiles table.
///
/// Postgres has no `ON UPDATE CURRENT_TIMESTAMP`, so a `BEFORE UPDATE` trigger keeps
/// `updated_at` fresh on every mutation.
pub const PROFILES_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
  id          BIGSERIAL    PRIMARY KEY,
  external_id VARCHAR(255) NOT NULL UNIQUE,
  rank        VARCHAR(12)  NOT NULL DEFAULT 'Rct.'
              CHECK (rank IN ('Rct.', 'Pvt.', 'L/Cpl.', 'Cpl.', 'Sgt.', 'S/Sgt.', '2 Lt.', 'Lt.', 'Capt.', 'Maj.')),
  first_name  VARCHAR(25)  NOT NULL,
  surname     VARCHAR(25)  NOT NULL,
  level       INTEGER      NOT NULL DEFAULT 1,
  funds       BIGINT       NOT NULL DEFAULT 0,
  is_nco      BOOLEAN      NOT NULL DEFAULT FALSE,
  is_officer  BOOLEAN      NOT NULL DEFAULT FALSE,
  created_at  TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
  updated_at  TIMESTAMPTZ  NOT NULL DEFAULT NOW()
);

CREATE OR REPLACE FUNCTION profiles_touch_updated_at() RETURNS TRIGGER AS $$
BEGIN
  NEW.updated_at = NOW();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS profiles_touch_updated_at ON profiles;
CREATE TRIGGER profiles_touch_updated_at
  BEFORE UPDATE ON profiles
  FOR EACH ROW EXECUTE FUNCTION profiles_touch_updated_at();
"#;

#[derive(Clone)]
pub struct ProfileDb {
    client: Arc<Mutex<Client>>,
    database_url: String,
}

impl ProfileDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "profile postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            database_url: database_url.to_string(),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .batch_execute(PROFILES_SCHEMA_SQL)
            .await
            .context("initialize profiles schema")?;
        tracing::info!("profiles schema ready");
        Ok(())
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Connection string handed to the export executable.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}
