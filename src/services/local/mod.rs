//! Local filesystem backend.
//!
//! Experiments are directories directly under `base_path`. Models live under
//! `user_data_path/{robots,brains,environments}`, attachments under
//! `base_path/KG_DATA`. Ownership and sharing metadata is kept in the SQLite
//! [`MetadataStore`].

pub mod db;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::{
    collections::BTreeSet,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use db::MetadataStore;

use super::{
    cloner::config::{ExperimentConfig, root_config_name},
    custom_models::stored_archive_name,
    storage::Storage,
};
use crate::{
    errors::{StorageError, StorageResult},
    models::{
        AccessRecord, CloneResult, EntryRef, EntryType, ExperimentRef, FileContent, FileEntry,
        FileLocator, ListScope, ModelMetadata, ModelRecord, ModelType, ScanReport, SharedUser,
        SharingMode, UserContext, WriteMode,
    },
    utils,
};

pub const USER_DATA_FOLDER: &str = "USER_DATA";
pub const DB_FOLDER: &str = "FS_db";
pub const ATTACHMENTS_FOLDER: &str = "KG_DATA";
/// Folders under the storage root that are never experiments.
const INTERNALS: [&str; 3] = [DB_FOLDER, USER_DATA_FOLDER, ATTACHMENTS_FOLDER];

/// [`Storage`] over a local directory tree plus a SQLite metadata store.
#[derive(Clone)]
pub struct LocalStorage {
    pub store: MetadataStore,

    /// Directory holding one sub-directory per experiment.
    pub base_path: PathBuf,

    /// Directory holding custom model archives.
    pub user_data_path: PathBuf,
}

impl LocalStorage {
    pub fn new(
        store: MetadataStore,
        base_path: impl Into<PathBuf>,
        user_data_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            base_path: base_path.into(),
            user_data_path: user_data_path.into(),
        }
    }

    /// Create the storage layout under `base_path` and open its database.
    ///
    /// Defaults: models under `{base}/USER_DATA`, database at
    /// `{base}/FS_db/metadata.db`.
    pub async fn open(
        base_path: impl Into<PathBuf>,
        user_data_path: Option<PathBuf>,
        database_url: Option<&str>,
    ) -> StorageResult<Self> {
        let base_path = base_path.into();
        let user_data_path = user_data_path.unwrap_or_else(|| base_path.join(USER_DATA_FOLDER));
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(&user_data_path).await?;
        for model_type in ModelType::ALL {
            fs::create_dir_all(user_data_path.join(model_type.folder())).await?;
        }

        let store = match database_url {
            Some(url) => MetadataStore::connect(url).await?,
            None => {
                let db_dir = base_path.join(DB_FOLDER);
                fs::create_dir_all(&db_dir).await?;
                let url = format!("sqlite://{}", db_dir.join("metadata.db").display());
                MetadataStore::connect(&url).await?
            }
        };
        store.migrate().await?;

        info!(
            base = %base_path.display(),
            user_data = %user_data_path.display(),
            "opened local storage"
        );
        Ok(Self::new(store, base_path, user_data_path))
    }

    /// Resolve a storage relative path to an absolute one.
    ///
    /// Rejects `..`, absolute and prefixed paths before touching the
    /// filesystem, then checks the joined result is still under the root.
    pub fn calculate_file_path(&self, relative: &str) -> StorageResult<PathBuf> {
        let clean = utils::sanitize_relative_path(relative)?;
        let full = self.base_path.join(clean);
        if !full.starts_with(&self.base_path) {
            return Err(StorageError::Authorization(format!(
                "path `{relative}` escapes the storage root"
            )));
        }
        Ok(full)
    }

    fn model_file_path(&self, model_type: ModelType, file_name: &str) -> StorageResult<PathBuf> {
        let clean = utils::sanitize_relative_path(file_name)?;
        Ok(self.user_data_path.join(model_type.folder()).join(clean))
    }

    fn attachment_path(&self, name: &str) -> StorageResult<PathBuf> {
        self.calculate_file_path(&utils::join_key([ATTACHMENTS_FOLDER, name]))
    }

    /// Check the caller may touch `relative`, authorizing on its first segment.
    ///
    /// Returns the experiment name.
    async fn authorize_path(&self, user: &UserContext, relative: &str) -> StorageResult<String> {
        let experiment = experiment_of(relative)?;
        let access = self.experiment_access(&experiment).await?;
        access.ensure_access(&experiment, &user.user_id)?;
        Ok(experiment)
    }

    async fn experiment_access(&self, experiment: &str) -> StorageResult<AccessRecord> {
        self.store
            .experiment_access(experiment)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("experiment `{experiment}`")))
    }

    async fn model_record(&self, model_type: ModelType, name: &str) -> StorageResult<ModelRecord> {
        self.store
            .model(model_type, name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{model_type} `{name}`")))
    }

    /// Locator to a storage relative id. By-name lookups are joined to the
    /// experiment so nested names keep working.
    fn resolve_locator(locator: FileLocator<'_>) -> String {
        match locator {
            FileLocator::Id(id) => id.to_string(),
            FileLocator::Name { experiment, name } => utils::join_key([experiment, name]),
        }
    }

    /// Names of the directories under the root that may be experiments.
    async fn experiment_folders(&self) -> StorageResult<BTreeSet<String>> {
        let mut folders = BTreeSet::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_experiment_folder(&name) {
                folders.insert(name);
            }
        }
        Ok(folders)
    }

    /// Write through a temporary file in the same directory, then rename.
    async fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("file path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = fs::write(&tmp_path, content).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    async fn append(path: &Path, content: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        Ok(())
    }

    /// Load the root configuration of an experiment, if it has one.
    async fn load_root_config(
        &self,
        experiment: &str,
    ) -> StorageResult<Option<(PathBuf, ExperimentConfig)>> {
        let dir = self.calculate_file_path(experiment)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        let Some(config_name) = root_config_name(names.iter().map(String::as_str)) else {
            return Ok(None);
        };
        let path = dir.join(config_name);
        let content = fs::read(&path).await?;
        let config = ExperimentConfig::parse(config_name, &content)?;
        Ok(Some((path, config)))
    }

    /// Copy every file of `source` into `destination`, concurrently.
    async fn copy_folder_contents(&self, source: &str, destination: &str) -> StorageResult<usize> {
        let source_dir = self.calculate_file_path(source)?;
        let dest_dir = self.calculate_file_path(destination)?;
        let walk_root = source_dir.clone();
        let files = tokio::task::spawn_blocking(move || utils::walk_files(&walk_root))
            .await
            .map_err(|err| {
                StorageError::Inconsistency(format!("directory walk panicked: {err}"))
            })??;

        try_join_all(files.iter().map(|relative| {
            let from = source_dir.join(relative);
            let to = dest_dir.join(relative);
            async move {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&from, &to).await?;
                Ok::<_, StorageError>(())
            }
        }))
        .await?;
        Ok(files.len())
    }

    async fn models_matching<F>(
        &self,
        model_type: ModelType,
        keep: F,
    ) -> StorageResult<Vec<ModelRecord>>
    where
        F: Fn(&AccessRecord) -> bool + Send,
    {
        let models = self.store.models_by_type(model_type).await?;
        Ok(models
            .into_iter()
            .filter(|model| keep(&access_of(model)))
            .collect())
    }
}

fn access_of(model: &ModelRecord) -> AccessRecord {
    AccessRecord {
        owner_id: model.owner_id.clone(),
        sharing_mode: model.sharing_mode,
        shared_users: model.shared_users.iter().cloned().collect(),
    }
}

fn is_experiment_folder(name: &str) -> bool {
    !INTERNALS.contains(&name) && !name.starts_with('.')
}

/// First segment of a relative path, refusing internal folders.
fn experiment_of(relative: &str) -> StorageResult<String> {
    let clean = utils::sanitize_relative_path(relative)?;
    let first = match clean.components().next() {
        Some(Component::Normal(first)) => first.to_string_lossy().into_owned(),
        _ => {
            return Err(StorageError::Validation(format!(
                "`{relative}` does not name an experiment"
            )));
        }
    };
    if !is_experiment_folder(&first) {
        return Err(StorageError::forbidden(&first));
    }
    Ok(first)
}

/// An experiment name must be a single plain path segment.
fn validate_experiment_name(name: &str) -> StorageResult<()> {
    let clean = utils::sanitize_relative_path(name)?;
    if clean.components().count() != 1 {
        return Err(StorageError::Validation(format!(
            "experiment name `{name}` must be a single folder name"
        )));
    }
    experiment_of(name).map(|_| ())
}

fn map_missing(err: io::Error, what: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(what.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self, user: &UserContext, folder: &str) -> StorageResult<Vec<FileEntry>> {
        self.authorize_path(user, folder).await?;
        let dir = self.calculate_file_path(folder)?;
        let prefix = utils::join_key([folder]);

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| map_missing(err, &format!("folder `{folder}`")))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            let metadata = entry.metadata().await?;
            files.push(FileEntry {
                uuid: utils::join_key([prefix.as_str(), name.as_str()]),
                name,
                size: metadata.len(),
                entry_type: if metadata.is_dir() {
                    EntryType::Folder
                } else {
                    EntryType::File
                },
                modified_on: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn get_file(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<FileContent> {
        let id = Self::resolve_locator(locator);
        self.authorize_path(user, &id).await?;
        let path = self.calculate_file_path(&id)?;
        let body = fs::read(&path)
            .await
            .map_err(|err| map_missing(err, &format!("file `{id}`")))?;

        Ok(FileContent {
            content_type: utils::content_type_for(&id),
            content_disposition: format!("attachment; filename={}", utils::basename(&id)),
            uuid: id,
            body: Bytes::from(body),
        })
    }

    async fn delete_file(&self, user: &UserContext, locator: FileLocator<'_>) -> StorageResult<()> {
        let id = Self::resolve_locator(locator);
        self.authorize_path(user, &id).await?;
        let path = self.calculate_file_path(&id)?;
        fs::remove_file(&path)
            .await
            .map_err(|err| map_missing(err, &format!("file `{id}`")))?;
        debug!("removed file {}", path.display());
        Ok(())
    }

    async fn delete_folder(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<()> {
        let id = Self::resolve_locator(locator);
        self.authorize_path(user, &id).await?;
        let path = self.calculate_file_path(&id)?;
        fs::remove_dir_all(&path)
            .await
            .map_err(|err| map_missing(err, &format!("folder `{id}`")))?;
        debug!("removed folder {}", path.display());
        Ok(())
    }

    async fn create_folder(
        &self,
        user: &UserContext,
        parent: &str,
        name: &str,
    ) -> StorageResult<EntryRef> {
        let id = utils::join_key([parent, name]);
        self.authorize_path(user, &id).await?;
        let path = self.calculate_file_path(&id)?;
        fs::create_dir_all(&path).await?;
        Ok(EntryRef {
            uuid: id,
            name: name.to_string(),
            entry_type: EntryType::Folder,
        })
    }

    async fn create_or_update(
        &self,
        user: &UserContext,
        experiment: &str,
        file_name: &str,
        content: Bytes,
        _content_type: &str,
        mode: WriteMode,
    ) -> StorageResult<EntryRef> {
        let id = utils::join_key([experiment, file_name]);
        self.authorize_path(user, &id).await?;
        let path = self.calculate_file_path(&id)?;
        match mode {
            WriteMode::Overwrite => Self::write_atomic(&path, &content).await?,
            WriteMode::Append => Self::append(&path, &content).await?,
        }
        debug!(file = %id, bytes = content.len(), ?mode, "wrote file");
        Ok(EntryRef {
            uuid: id,
            name: utils::basename(file_name).to_string(),
            entry_type: EntryType::File,
        })
    }

    async fn list_experiments(
        &self,
        user: &UserContext,
        scope: ListScope,
    ) -> StorageResult<Vec<ExperimentRef>> {
        let folders = self.experiment_folders().await?;
        let names: Vec<String> = match scope {
            ListScope::All => {
                let mut all = folders;
                all.extend(self.store.experiment_names().await?);
                all.into_iter().collect()
            }
            ListScope::Owned => {
                for folder in &folders {
                    if self.store.experiment_access(folder).await?.is_none() {
                        match self.store.insert_experiment(folder, &user.user_id, None).await {
                            Ok(()) => debug!(experiment = %folder, "registered unknown folder"),
                            Err(StorageError::Conflict(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
                let mut owned = Vec::new();
                for name in self.store.experiments_owned_by(&user.user_id).await? {
                    if folders.contains(&name) {
                        owned.push(name);
                    } else {
                        self.store.delete_experiment(&name).await?;
                        debug!(experiment = %name, "dropped record of deleted folder");
                    }
                }
                owned
            }
        };
        Ok(names.into_iter().map(ExperimentRef::named).collect())
    }

    async fn create_experiment(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<ExperimentRef> {
        validate_experiment_name(name)?;
        self.store.insert_experiment(name, &user.user_id, None).await?;
        let path = self.calculate_file_path(name)?;
        fs::create_dir_all(&path).await?;
        info!(experiment = %name, owner = %user.user_id, "created experiment");
        Ok(ExperimentRef::named(name))
    }

    async fn delete_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()> {
        let experiment = experiment_of(name)?;
        let access = self.experiment_access(&experiment).await?;
        access.ensure_owner(&experiment, &user.user_id)?;

        let path = self.calculate_file_path(&experiment)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("experiment folder {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        self.store.delete_experiment(&experiment).await?;
        info!(experiment = %experiment, "deleted experiment");
        Ok(())
    }

    async fn copy_experiment(&self, user: &UserContext, name: &str) -> StorageResult<CloneResult> {
        let experiment = self.authorize_path(user, name).await?;
        let copied = self.create_unique_experiment_id(user, &experiment).await?;
        let clone_date = utils::current_time_and_date();

        self.store
            .insert_experiment(&copied, &user.user_id, Some(&clone_date))
            .await?;
        fs::create_dir_all(self.calculate_file_path(&copied)?).await?;
        let count = self.copy_folder_contents(&experiment, &copied).await?;

        if let Some((path, mut config)) = self.load_root_config(&copied).await? {
            config.set_clone_date(&clone_date);
            Self::write_atomic(&path, &config.root_bytes()?).await?;
        }

        info!(from = %experiment, to = %copied, files = count, "copied experiment");
        Ok(CloneResult {
            cloned_exp: copied,
            original_exp: experiment,
        })
    }

    async fn rename_experiment(
        &self,
        user: &UserContext,
        name: &str,
        display_name: &str,
    ) -> StorageResult<()> {
        let experiment = self.authorize_path(user, name).await?;
        let Some((path, mut config)) = self.load_root_config(&experiment).await? else {
            return Err(StorageError::NotFound(format!(
                "configuration of experiment `{experiment}`"
            )));
        };
        config.set_name(display_name);
        Self::write_atomic(&path, &config.root_bytes()?).await?;
        debug!(experiment = %experiment, display_name, "renamed experiment");
        Ok(())
    }

    async fn register_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()> {
        validate_experiment_name(name)?;
        let path = self.calculate_file_path(name)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(format!("experiment folder `{name}`")));
        }
        self.store.insert_experiment(name, &user.user_id, None).await
    }

    async fn scan_storage(&self, user: &UserContext) -> StorageResult<ScanReport> {
        let folders = self.experiment_folders().await?;
        let known: BTreeSet<String> = self.store.experiment_names().await?.into_iter().collect();

        let mut report = ScanReport::default();
        for folder in folders.difference(&known) {
            match self.store.insert_experiment(folder, &user.user_id, None).await {
                Ok(()) => report.added.push(folder.clone()),
                Err(StorageError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        for name in known.difference(&folders) {
            if self.store.delete_experiment(name).await? {
                report.removed.push(name.clone());
            }
        }
        info!(added = report.added.len(), removed = report.removed.len(), "scanned storage");
        Ok(report)
    }

    async fn get_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let access = self.experiment_access(name).await?;
        access.ensure_access(name, &user.user_id)?;
        Ok(access.sharing_mode)
    }

    async fn update_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        self.experiment_access(name).await?.ensure_owner(name, &user.user_id)?;
        self.store.set_experiment_sharing_mode(name, mode).await
    }

    async fn list_experiment_shared_users(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let access = self.experiment_access(name).await?;
        access.ensure_access(name, &user.user_id)?;
        Ok(access.shared_users.into_iter().collect())
    }

    async fn add_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        self.experiment_access(name).await?.ensure_owner(name, &user.user_id)?;
        self.store.add_experiment_shared_user(name, shared_with).await
    }

    async fn remove_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()> {
        self.experiment_access(name).await?.ensure_owner(name, &user.user_id)?;
        self.store.remove_experiment_shared_user(name, &target).await
    }

    async fn list_experiments_shared_with(
        &self,
        user: &UserContext,
    ) -> StorageResult<Vec<ExperimentRef>> {
        Ok(self
            .store
            .experiments_shared_with(&user.user_id)
            .await?
            .into_iter()
            .map(ExperimentRef::named)
            .collect())
    }

    async fn create_custom_model(
        &self,
        user: &UserContext,
        metadata: &ModelMetadata,
        archive: Bytes,
    ) -> StorageResult<ModelRecord> {
        let model_type = metadata.model_type;
        let existing = self.store.model(model_type, &metadata.name).await?;
        if let Some(existing) = &existing
            && existing.owner_id.as_deref() != Some(user.user_id.as_str())
        {
            return Err(StorageError::Conflict(format!(
                "{model_type} `{}`",
                metadata.name
            )));
        }

        let file_name = stored_archive_name(&metadata.name);
        let path = self.model_file_path(model_type, &file_name)?;
        Self::write_atomic(&path, &archive).await?;

        let record = ModelRecord {
            name: metadata.name.clone(),
            model_type,
            owner_id: Some(user.user_id.clone()),
            path: utils::join_key([model_type.folder(), file_name.as_str()]),
            file_name,
            is_custom: true,
            sharing_mode: existing.map(|m| m.sharing_mode).unwrap_or_default(),
            shared_users: Vec::new(),
        };
        self.store.upsert_model(&record).await?;
        info!(model = %record.name, %model_type, "stored custom model");
        self.model_record(model_type, &record.name).await
    }

    async fn get_model_zip(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Bytes> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_access(name, &user.user_id)?;
        let path = self.model_file_path(model_type, &record.file_name)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| map_missing(err, &format!("archive of {model_type} `{name}`")))?;
        Ok(Bytes::from(data))
    }

    async fn delete_custom_model(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<()> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_owner(name, &user.user_id)?;
        let path = self.model_file_path(model_type, &record.file_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("archive {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        self.store.delete_model(model_type, name).await?;
        Ok(())
    }

    async fn list_models_by_type(
        &self,
        _user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.store.models_by_type(model_type).await
    }

    async fn list_user_models_by_type(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(model_type, |access| access.is_owner(&user.user_id))
            .await
    }

    async fn list_shared_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(model_type, |access| access.is_shared_with(&user.user_id))
            .await
    }

    async fn list_all_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(model_type, |access| access.allows(&user.user_id))
            .await
    }

    async fn get_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_access(name, &user.user_id)?;
        Ok(record.sharing_mode)
    }

    async fn update_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_owner(name, &user.user_id)?;
        self.store.set_model_sharing_mode(model_type, name, mode).await
    }

    async fn list_model_shared_users(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_access(name, &user.user_id)?;
        Ok(record.shared_users)
    }

    async fn add_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_owner(name, &user.user_id)?;
        self.store.add_model_shared_user(model_type, name, shared_with).await
    }

    async fn remove_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()> {
        let record = self.model_record(model_type, name).await?;
        access_of(&record).ensure_owner(name, &user.user_id)?;
        self.store.remove_model_shared_user(model_type, name, &target).await
    }

    async fn create_or_update_attachment(&self, name: &str, content: Bytes) -> StorageResult<()> {
        let path = self.attachment_path(name)?;
        Self::write_atomic(&path, &content).await
    }

    async fn get_attachment(&self, name: &str) -> StorageResult<Bytes> {
        let path = self.attachment_path(name)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| map_missing(err, &format!("attachment `{name}`")))?;
        Ok(Bytes::from(data))
    }

    async fn delete_attachment(&self, name: &str) -> StorageResult<()> {
        let path = self.attachment_path(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|err| map_missing(err, &format!("attachment `{name}`")))
    }
}
