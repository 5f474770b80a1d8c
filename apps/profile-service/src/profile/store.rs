use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::db::ProfileDb;
use crate::profile::types::{DEFAULT_FUNDS, DEFAULT_LEVEL, NewProfile, Profile, Rank};

#[derive(Debug, thiserror::Error)]
pub enum ProfileStoreError {
    #[error("profile already exists for external id {0}")]
    AlreadyExists(String),
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn create(&self, profile: NewProfile) -> Result<Profile, ProfileStoreError>;

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Profile>, ProfileStoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Profile>, ProfileStoreError>;

    /// All profiles in creation (id) order.
    async fn list_all(&self) -> Result<Vec<Profile>, ProfileStoreError>;

    async fn delete(&self, id: i64) -> Result<(), ProfileStoreError>;

    fn backend_name(&self) -> &'static str;
}

pub fn memory() -> Arc<dyn ProfileStore> {
    Arc::new(MemoryProfileStore::default())
}

pub fn postgres(db: Arc<ProfileDb>, call_timeout: Duration) -> Arc<dyn ProfileStore> {
    Arc::new(PostgresProfileStore { db, call_timeout })
}

#[derive(Default)]
struct MemoryProfileStore {
    inner: Mutex<MemoryProfileInner>,
}

#[derive(Default)]
struct MemoryProfileInner {
    next_id: i64,
    profiles_by_id: BTreeMap<i64, Profile>,
    id_by_external_id: BTreeMap<String, i64>,
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn create(&self, profile: NewProfile) -> Result<Profile, ProfileStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.id_by_external_id.contains_key(&profile.external_id) {
            return Err(ProfileStoreError::AlreadyExists(profile.external_id));
        }

        inner.next_id += 1;
        let now = Utc::now();
        let row = Profile {
            id: inner.next_id,
            external_id: profile.external_id,
            rank: Rank::default(),
            first_name: profile.first_name,
            surname: profile.surname,
            level: DEFAULT_LEVEL,
            funds: DEFAULT_FUNDS,
            is_nco: false,
            is_officer: false,
            created_at: now,
            updated_at: now,
        };
        inner
            .id_by_external_id
            .insert(row.external_id.clone(), row.id);
        inner.profiles_by_id.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Profile>, ProfileStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .id_by_external_id
            .get(external_id)
            .and_then(|id| inner.profiles_by_id.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Profile>, ProfileStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.profiles_by_id.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Profile>, ProfileStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.profiles_by_id.values().cloned().collect())
    }

    async fn delete(&self, id: i64) -> Result<(), ProfileStoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .profiles_by_id
            .remove(&id)
            .ok_or_else(|| ProfileStoreError::NotFound(format!("id {id}")))?;
        inner.id_by_external_id.remove(&removed.external_id);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct PostgresProfileStore {
    db: Arc<ProfileDb>,
    call_timeout: Duration,
}

const PROFILE_COLUMNS: &str = "id, external_id, rank, first_name, surname, level, funds, \
                               is_nco, is_officer, created_at, updated_at";

fn select_profiles(tail: &str) -> String {
    format!("SELECT {PROFILE_COLUMNS} FROM profiles {tail}")
}

/// Applies `call_timeout` to the whole call, including the wait for the shared client.
async fn bounded<T, F>(call_timeout: Duration, call: F) -> Result<T, ProfileStoreError>
where
    F: Future<Output = Result<T, tokio_postgres::Error>>,
{
    match tokio::time::timeout(call_timeout, call).await {
        Ok(result) => result.map_err(|error| ProfileStoreError::Db(error.to_string())),
        Err(_) => Err(ProfileStoreError::Db(format!(
            "store call exceeded {} ms",
            call_timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl ProfileStore for PostgresProfileStore {
    async fn create(&self, profile: NewProfile) -> Result<Profile, ProfileStoreError> {
        let statement = format!(
            "INSERT INTO profiles (external_id, first_name, surname)
             VALUES ($1, $2, $3)
             ON CONFLICT (external_id) DO NOTHING
             RETURNING {PROFILE_COLUMNS}"
        );
        let client = self.db.client();
        let inserted = bounded(self.call_timeout, async {
            let client = client.lock().await;
            client
                .query_opt(
                    statement.as_str(),
                    &[&profile.external_id, &profile.first_name, &profile.surname],
                )
                .await
        })
        .await?;

        let Some(row) = inserted else {
            return Err(ProfileStoreError::AlreadyExists(profile.external_id));
        };
        map_profile_row(&row).map_err(ProfileStoreError::Db)
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Profile>, ProfileStoreError> {
        let statement = select_profiles("WHERE external_id = $1");
        let client = self.db.client();
        let row = bounded(self.call_timeout, async {
            let client = client.lock().await;
            client.query_opt(statement.as_str(), &[&external_id]).await
        })
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_profile_row(&row).map_err(ProfileStoreError::Db)?))
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Profile>, ProfileStoreError> {
        let statement = select_profiles("WHERE id = $1");
        let client = self.db.client();
        let row = bounded(self.call_timeout, async {
            let client = client.lock().await;
            client.query_opt(statement.as_str(), &[&id]).await
        })
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_profile_row(&row).map_err(ProfileStoreError::Db)?))
    }

    async fn list_all(&self) -> Result<Vec<Profile>, ProfileStoreError> {
        let statement = select_profiles("ORDER BY id ASC");
        let client = self.db.client();
        let rows = bounded(self.call_timeout, async {
            let client = client.lock().await;
            client.query(statement.as_str(), &[]).await
        })
        .await?;
        rows.iter()
            .map(|row| map_profile_row(row).map_err(ProfileStoreError::Db))
            .collect()
    }

    async fn delete(&self, id: i64) -> Result<(), ProfileStoreError> {
        let client = self.db.client();
        let affected = bounded(self.call_timeout, async {
            let client = client.lock().await;
            client
                .execute("DELETE FROM profiles WHERE id = $1", &[&id])
                .await
        })
        .await?;
        if affected == 0 {
            return Err(ProfileStoreError::NotFound(format!("id {id}")));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn map_profile_row(row: &tokio_postgres::Row) -> Result<Profile, String> {
    let rank: String = row.try_get("rank").map_err(|error| error.to_string())?;
    Ok(Profile {
        id: row.try_get("id").map_err(|error| error.to_string())?,
        external_id: row.try_get("external_id").map_err(|error| error.to_string())?,
        rank: rank.parse::<Rank>().map_err(|error| error.to_string())?,
        first_name: row.try_get("first_name").map_err(|error| error.to_string())?,
        surname: row.try_get("surname").map_err(|error| error.to_string())?,
        level: row.try_get("level").map_err(|error| error.to_string())?,
        funds: row.try_get("funds").map_err(|error| error.to_string())?,
        is_nco: row.try_get("is_nco").map_err(|error| error.to_string())?,
        is_officer: row.try_get("is_officer").map_err(|error| error.to_string())?,
        created_at: row.try_get("created_at").map_err(|error| error.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|error| error.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};

    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::{ProfileStoreError, bounded, memory};
    use crate::profile::types::{NewProfile, Rank};

    fn new_profile(external_id: &str, first_name: &str, surname: &str) -> NewProfile {
        NewProfile {
            external_id: external_id.to_string(),
            first_name: first_name.to_string(),
            surname: surname.to_string(),
        }
    }

    #[tokio::test]
    async fn create_applies_defaults_and_rejects_duplicate_external_id() -> Result<()> {
        let store = memory();
        let created = store.create(new_profile("42", "John", "Smith")).await?;
        assert_eq!(created.rank, Rank::Recruit);
        assert_eq!(created.level, 1);
        assert_eq!(created.funds, 0);
        assert!(!created.is_nco);
        assert!(!created.is_officer);
        assert_eq!(created.created_at, created.updated_at);

        let duplicate = store.create(new_profile("42", "Jane", "Doe")).await;
        assert!(matches!(
            duplicate,
            Err(ProfileStoreError::AlreadyExists(ref id)) if id == "42"
        ));

        let all = store.list_all().await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].first_name, "John");
        Ok(())
    }

    #[tokio::test]
    async fn lookups_by_external_id_and_id_agree() -> Result<()> {
        let store = memory();
        let created = store.create(new_profile("7", "Ada", "Lovelace")).await?;

        let by_external = store
            .get_by_external_id("7")
            .await?
            .ok_or_else(|| anyhow!("missing by external id"))?;
        let by_id = store
            .get_by_id(created.id)
            .await?
            .ok_or_else(|| anyhow!("missing by id"))?;
        assert_eq!(by_external, by_id);
        assert!(store.get_by_external_id("8").await?.is_none());
        assert!(store.get_by_id(created.id + 1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_all_keeps_creation_order() -> Result<()> {
        let store = memory();
        for (external_id, name) in [("30", "Cara"), ("10", "Abe"), ("20", "Bea")] {
            store.create(new_profile(external_id, name, "Tester")).await?;
        }
        let external_ids: Vec<String> = store
            .list_all()
            .await?
            .into_iter()
            .map(|profile| profile.external_id)
            .collect();
        assert_eq!(external_ids, vec!["30", "10", "20"]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_frees_external_id_and_reports_missing_rows() -> Result<()> {
        let store = memory();
        let created = store.create(new_profile("42", "John", "Smith")).await?;
        store.delete(created.id).await?;
        assert!(store.get_by_id(created.id).await?.is_none());
        assert!(store.get_by_external_id("42").await?.is_none());

        let missing = store.delete(created.id).await;
        assert!(matches!(missing, Err(ProfileStoreError::NotFound(_))));

        let recreated = store.create(new_profile("42", "John", "Smith")).await?;
        assert_ne!(recreated.id, created.id);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_calls_time_out_while_waiting_for_the_client() -> Result<()> {
        let client = Mutex::new(());
        let _held = client.lock().await;

        let waited = bounded(Duration::from_millis(250), async {
            let _client = client.lock().await;
            Ok::<_, tokio_postgres::Error>(())
        })
        .await;
        match waited {
            Err(ProfileStoreError::Db(reason)) => assert!(reason.contains("250 ms")),
            other => return Err(anyhow!("expected timeout, got {other:?}")),
        }
        Ok(())
    }
}
