//! SQLite metadata store for the local backend.
//!
//! Holds who owns each experiment and model and who else may see it. File
//! bytes never go through here.

use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};

use crate::{
    errors::{StorageError, StorageResult},
    models::{AccessRecord, Experiment, ModelRecord, ModelType, SharedUser, SharingMode},
};

const INIT_SQL: &str = include_str!("../../../migrations/0001_init.sql");

#[derive(FromRow, Debug)]
struct ExperimentRow {
    name: String,
    owner_id: String,
    sharing_mode: String,
    clone_date: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow, Debug)]
struct ModelRow {
    #[sqlx(rename = "type")]
    model_type: String,
    name: String,
    owner_id: String,
    file_name: String,
    path: String,
    is_custom: bool,
    sharing_mode: String,
}

/// Handle on the metadata database. Cheap to clone.
#[derive(Clone)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Private in-memory database with the schema applied.
    ///
    /// A single connection keeps every query on the same memory database.
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("running {} migration statements", statements.len());
        for stmt in statements {
            debug!("executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    // --- experiments ---

    pub async fn experiment(&self, name: &str) -> StorageResult<Option<Experiment>> {
        let row = sqlx::query_as::<_, ExperimentRow>(
            "SELECT name, owner_id, sharing_mode, clone_date, created_at
             FROM experiments WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => {
                let shared_user_ids = self.experiment_shared_users(name).await?;
                Ok(Some(Experiment {
                    name: row.name,
                    owner_id: row.owner_id,
                    sharing_mode: parse_mode(&row.sharing_mode),
                    shared_user_ids,
                    clone_date: row.clone_date,
                    created_at: row.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn experiment_access(&self, name: &str) -> StorageResult<Option<AccessRecord>> {
        Ok(self.experiment(name).await?.map(|exp| AccessRecord {
            owner_id: Some(exp.owner_id),
            sharing_mode: exp.sharing_mode,
            shared_users: exp.shared_user_ids.into_iter().collect(),
        }))
    }

    /// The only compare-and-swap step of experiment creation.
    ///
    /// Fails with Conflict when the name is already registered.
    pub async fn insert_experiment(
        &self,
        name: &str,
        owner_id: &str,
        clone_date: Option<&str>,
    ) -> StorageResult<()> {
        match sqlx::query(
            "INSERT INTO experiments (name, owner_id, sharing_mode, clone_date, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(owner_id)
        .bind(SharingMode::default().as_str())
        .bind(clone_date)
        .bind(Utc::now())
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::Conflict(format!("experiment `{name}`")))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Returns whether a row was removed.
    pub async fn delete_experiment(&self, name: &str) -> StorageResult<bool> {
        sqlx::query("DELETE FROM experiment_shared_users WHERE experiment = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;
        let result = sqlx::query("DELETE FROM experiments WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn experiment_names(&self) -> StorageResult<Vec<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT name FROM experiments ORDER BY name")
                .fetch_all(&*self.db)
                .await?,
        )
    }

    pub async fn experiments_owned_by(&self, owner_id: &str) -> StorageResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT name FROM experiments WHERE owner_id = ? ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Experiments of other owners that are public or shared with `user_id`.
    pub async fn experiments_shared_with(&self, user_id: &str) -> StorageResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT name FROM experiments e
             WHERE e.owner_id != ?1
               AND (e.sharing_mode = 'Public'
                    OR (e.sharing_mode = 'Shared'
                        AND EXISTS (SELECT 1 FROM experiment_shared_users s
                                    WHERE s.experiment = e.name AND s.user_id = ?1)))
             ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn set_experiment_sharing_mode(
        &self,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE experiments SET sharing_mode = ? WHERE name = ?")
            .bind(mode.as_str())
            .bind(name)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("experiment `{name}`")));
        }
        Ok(())
    }

    pub async fn experiment_shared_users(&self, name: &str) -> StorageResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM experiment_shared_users WHERE experiment = ? ORDER BY user_id",
        )
        .bind(name)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Adding a user twice is a no-op.
    pub async fn add_experiment_shared_user(&self, name: &str, user_id: &str) -> StorageResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO experiment_shared_users (experiment, user_id) VALUES (?, ?)",
        )
        .bind(name)
        .bind(user_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn remove_experiment_shared_user(
        &self,
        name: &str,
        target: &SharedUser,
    ) -> StorageResult<()> {
        match target {
            SharedUser::All => {
                sqlx::query("DELETE FROM experiment_shared_users WHERE experiment = ?")
                    .bind(name)
                    .execute(&*self.db)
                    .await?;
            }
            SharedUser::User(user_id) => {
                sqlx::query(
                    "DELETE FROM experiment_shared_users WHERE experiment = ? AND user_id = ?",
                )
                .bind(name)
                .bind(user_id)
                .execute(&*self.db)
                .await?;
            }
        }
        Ok(())
    }

    // --- models ---

    pub async fn model(
        &self,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Option<ModelRecord>> {
        let row = sqlx::query_as::<_, ModelRow>(
            "SELECT type, name, owner_id, file_name, path, is_custom, sharing_mode
             FROM models WHERE type = ? AND name = ?",
        )
        .bind(model_type.as_str())
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_model(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn model_access(
        &self,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Option<AccessRecord>> {
        Ok(self.model(model_type, name).await?.map(|model| AccessRecord {
            owner_id: model.owner_id,
            sharing_mode: model.sharing_mode,
            shared_users: model.shared_users.into_iter().collect(),
        }))
    }

    /// Insert or replace the row for `(type, name)`, keeping its sharing state.
    pub async fn upsert_model(&self, record: &ModelRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO models (type, name, owner_id, file_name, path, is_custom, sharing_mode)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(type, name) DO UPDATE SET
                owner_id = excluded.owner_id,
                file_name = excluded.file_name,
                path = excluded.path,
                is_custom = excluded.is_custom",
        )
        .bind(record.model_type.as_str())
        .bind(&record.name)
        .bind(&record.owner_id)
        .bind(&record.file_name)
        .bind(&record.path)
        .bind(record.is_custom)
        .bind(record.sharing_mode.as_str())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn delete_model(&self, model_type: ModelType, name: &str) -> StorageResult<bool> {
        sqlx::query("DELETE FROM model_shared_users WHERE type = ? AND name = ?")
            .bind(model_type.as_str())
            .bind(name)
            .execute(&*self.db)
            .await?;
        let result = sqlx::query("DELETE FROM models WHERE type = ? AND name = ?")
            .bind(model_type.as_str())
            .bind(name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn models_by_type(&self, model_type: ModelType) -> StorageResult<Vec<ModelRecord>> {
        let rows = sqlx::query_as::<_, ModelRow>(
            "SELECT type, name, owner_id, file_name, path, is_custom, sharing_mode
             FROM models WHERE type = ? ORDER BY name",
        )
        .bind(model_type.as_str())
        .fetch_all(&*self.db)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.hydrate_model(row).await?);
        }
        Ok(records)
    }

    pub async fn set_model_sharing_mode(
        &self,
        model_type: ModelType,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE models SET sharing_mode = ? WHERE type = ? AND name = ?")
            .bind(mode.as_str())
            .bind(model_type.as_str())
            .bind(name)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("{model_type} `{name}`")));
        }
        Ok(())
    }

    pub async fn add_model_shared_user(
        &self,
        model_type: ModelType,
        name: &str,
        user_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO model_shared_users (type, name, user_id) VALUES (?, ?, ?)",
        )
        .bind(model_type.as_str())
        .bind(name)
        .bind(user_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn remove_model_shared_user(
        &self,
        model_type: ModelType,
        name: &str,
        target: &SharedUser,
    ) -> StorageResult<()> {
        let mut query = String::from("DELETE FROM model_shared_users WHERE type = ? AND name = ?");
        if matches!(target, SharedUser::User(_)) {
            query.push_str(" AND user_id = ?");
        }
        let mut statement = sqlx::query(&query)
            .bind(model_type.as_str())
            .bind(name);
        if let SharedUser::User(user_id) = target {
            statement = statement.bind(user_id.as_str());
        }
        statement.execute(&*self.db).await?;
        Ok(())
    }

    async fn hydrate_model(&self, row: ModelRow) -> StorageResult<ModelRecord> {
        let model_type = ModelType::from_str(&row.model_type)?;
        let shared_users = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM model_shared_users WHERE type = ? AND name = ? ORDER BY user_id",
        )
        .bind(&row.model_type)
        .bind(&row.name)
        .fetch_all(&*self.db)
        .await?;

        Ok(ModelRecord {
            name: row.name,
            model_type,
            owner_id: Some(row.owner_id),
            file_name: row.file_name,
            path: row.path,
            is_custom: row.is_custom,
            sharing_mode: parse_mode(&row.sharing_mode),
            shared_users,
        })
    }
}

/// Unknown or legacy values read back as the canonical default.
fn parse_mode(raw: &str) -> SharingMode {
    raw.parse().unwrap_or_default()
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn duplicate_experiment_is_conflict() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_experiment("exp", "alice", None).await.unwrap();
        let err = store.insert_experiment("exp", "bob", None).await.unwrap_err();
        assert_matches!(err, StorageError::Conflict(_));

        let exp = store.experiment("exp").await.unwrap().unwrap();
        assert_eq!(exp.owner_id, "alice");
        assert_eq!(exp.sharing_mode, SharingMode::Private);
    }

    #[tokio::test]
    async fn shared_listing_follows_mode_and_list() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_experiment("shared", "alice", None).await.unwrap();
        store.insert_experiment("public", "alice", None).await.unwrap();
        store.insert_experiment("own", "bob", None).await.unwrap();

        store.set_experiment_sharing_mode("shared", SharingMode::Shared).await.unwrap();
        store.add_experiment_shared_user("shared", "bob").await.unwrap();
        store.add_experiment_shared_user("shared", "bob").await.unwrap();
        store.set_experiment_sharing_mode("public", SharingMode::Public).await.unwrap();

        assert_eq!(
            store.experiments_shared_with("bob").await.unwrap(),
            vec!["public".to_string(), "shared".to_string()]
        );
        assert_eq!(
            store.experiments_shared_with("carol").await.unwrap(),
            vec!["public".to_string()]
        );
        assert_eq!(store.experiment_shared_users("shared").await.unwrap(), vec!["bob"]);

        store
            .remove_experiment_shared_user("shared", &SharedUser::All)
            .await
            .unwrap();
        assert!(store.experiment_shared_users("shared").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_upsert_keeps_sharing_state() {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut record = ModelRecord {
            name: "husky".into(),
            model_type: ModelType::Robot,
            owner_id: Some("alice".into()),
            file_name: "husky.zip".into(),
            path: "robots/husky.zip".into(),
            is_custom: true,
            sharing_mode: SharingMode::Private,
            shared_users: vec![],
        };
        store.upsert_model(&record).await.unwrap();
        store
            .set_model_sharing_mode(ModelType::Robot, "husky", SharingMode::Public)
            .await
            .unwrap();

        record.file_name = "husky_v2.zip".into();
        store.upsert_model(&record).await.unwrap();

        let stored = store.model(ModelType::Robot, "husky").await.unwrap().unwrap();
        assert_eq!(stored.file_name, "husky_v2.zip");
        assert_eq!(stored.sharing_mode, SharingMode::Public);
        assert!(store.model(ModelType::Brain, "husky").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn models_require_an_owner() {
        let store = MetadataStore::in_memory().await.unwrap();
        let record = ModelRecord {
            name: "orphan".into(),
            model_type: ModelType::Brain,
            owner_id: None,
            file_name: "orphan.zip".into(),
            path: "brains/orphan.zip".into(),
            is_custom: true,
            sharing_mode: SharingMode::Private,
            shared_users: vec![],
        };
        assert!(store.upsert_model(&record).await.is_err());
        assert!(store.models_by_type(ModelType::Brain).await.unwrap().is_empty());
    }
}
