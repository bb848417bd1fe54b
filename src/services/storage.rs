//! The capability interface shared by every storage backend.
//!
//! Callers hold an `Arc<dyn Storage>` and never learn which backend sits
//! behind it. Every method receives the caller's [`UserContext`]; operations
//! on an existing experiment or model authorize against it before touching
//! any bytes.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        CloneResult, EntryRef, ExperimentRef, FileContent, FileEntry, FileLocator, ListScope,
        ModelMetadata, ModelRecord, ModelType, ScanReport, SharedUser, SharingMode, UserContext,
        WriteMode,
    },
    utils,
};

#[async_trait]
pub trait Storage: Send + Sync {
    // --- files and folders ---

    /// Direct children of `folder` (an experiment id or a nested folder id).
    async fn list_files(&self, user: &UserContext, folder: &str) -> StorageResult<Vec<FileEntry>>;

    async fn get_file(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<FileContent>;

    async fn delete_file(&self, user: &UserContext, locator: FileLocator<'_>)
    -> StorageResult<()>;

    /// Remove a folder and everything below it.
    async fn delete_folder(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<()>;

    /// Create `name` inside `parent`. Creating an existing folder succeeds.
    async fn create_folder(
        &self,
        user: &UserContext,
        parent: &str,
        name: &str,
    ) -> StorageResult<EntryRef>;

    /// Write `content` to `experiment/file_name`, creating parent folders.
    async fn create_or_update(
        &self,
        user: &UserContext,
        experiment: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        mode: WriteMode,
    ) -> StorageResult<EntryRef>;

    // --- experiments ---

    async fn list_experiments(
        &self,
        user: &UserContext,
        scope: ListScope,
    ) -> StorageResult<Vec<ExperimentRef>>;

    /// Register `name` for the caller and create its empty folder.
    ///
    /// Fails with Conflict when an experiment of that name is already known.
    async fn create_experiment(&self, user: &UserContext, name: &str)
    -> StorageResult<ExperimentRef>;

    /// Remove the experiment contents first, then its metadata.
    async fn delete_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()>;

    /// Copy an experiment under a fresh unique name owned by the caller.
    async fn copy_experiment(&self, user: &UserContext, name: &str) -> StorageResult<CloneResult>;

    /// Rewrite the display name stored in the experiment's root configuration.
    async fn rename_experiment(
        &self,
        user: &UserContext,
        name: &str,
        display_name: &str,
    ) -> StorageResult<()>;

    /// Record metadata for a folder that was written out of band.
    async fn register_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()>;

    /// Reconcile metadata with the experiments actually present in storage.
    async fn scan_storage(&self, user: &UserContext) -> StorageResult<ScanReport>;

    /// First `{base}_{n}` not used by any known experiment.
    async fn create_unique_experiment_id(
        &self,
        user: &UserContext,
        base: &str,
    ) -> StorageResult<String> {
        let existing = self.list_experiments(user, ListScope::All).await?;
        let name = utils::unique_name(base, existing.iter().map(|exp| exp.name.as_str()));
        debug!(base, name = %name, "allocated experiment id");
        Ok(name)
    }

    /// Write every member of `archive` into `destination`.
    ///
    /// The archive's single root folder is replaced by `destination`; loose
    /// top-level members are written as they are. The destination experiment
    /// must already exist.
    async fn extract_zip(
        &self,
        user: &UserContext,
        archive: Bytes,
        destination: &str,
    ) -> StorageResult<Vec<String>> {
        let entries = tokio::task::spawn_blocking(move || utils::read_zip_entries(&archive))
            .await
            .map_err(|err| StorageError::Inconsistency(format!("zip reader panicked: {err}")))??;

        let roots = utils::zip_root_folders(entries.iter().map(|(name, _)| name.as_str()));
        let strip = (roots.len() == 1).then(|| roots.into_iter().next()).flatten();

        let mut written = Vec::with_capacity(entries.len());
        for (name, data) in entries {
            let relative = match &strip {
                Some(root) => name
                    .strip_prefix(root.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .unwrap_or(&name)
                    .to_string(),
                None => name.clone(),
            };
            let content_type = utils::content_type_for(&relative);
            self.create_or_update(
                user,
                destination,
                &relative,
                Bytes::from(data),
                &content_type,
                WriteMode::Overwrite,
            )
            .await?;
            written.push(relative);
        }
        debug!(destination, files = written.len(), "extracted archive");
        Ok(written)
    }

    // --- experiment sharing ---

    async fn get_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<SharingMode>;

    async fn update_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()>;

    async fn list_experiment_shared_users(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<Vec<String>>;

    async fn add_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()>;

    async fn remove_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()>;

    /// Experiments other users made visible to the caller.
    async fn list_experiments_shared_with(
        &self,
        user: &UserContext,
    ) -> StorageResult<Vec<ExperimentRef>>;

    // --- models ---

    /// Store a validated model archive and register it for the caller.
    async fn create_custom_model(
        &self,
        user: &UserContext,
        metadata: &ModelMetadata,
        archive: Bytes,
    ) -> StorageResult<ModelRecord>;

    async fn get_model_zip(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Bytes>;

    /// Owner only.
    async fn delete_custom_model(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<()>;

    /// Every registered model of a type, whoever owns it.
    async fn list_models_by_type(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>>;

    /// Models of a type owned by the caller.
    async fn list_user_models_by_type(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>>;

    /// Models of a type other users made visible to the caller.
    async fn list_shared_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>>;

    /// Templates plus owned plus shared models of a type.
    async fn list_all_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>>;

    // --- model sharing ---

    async fn get_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<SharingMode>;

    async fn update_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()>;

    async fn list_model_shared_users(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Vec<String>>;

    async fn add_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()>;

    async fn remove_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()>;

    // --- attachments ---

    /// Globally addressed blobs, not scoped to any experiment.
    async fn create_or_update_attachment(&self, name: &str, content: Bytes)
    -> StorageResult<()>;

    async fn get_attachment(&self, name: &str) -> StorageResult<Bytes>;

    async fn delete_attachment(&self, name: &str) -> StorageResult<()>;
}
