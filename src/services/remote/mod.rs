//! Remote bucket backend.
//!
//! Experiments are key prefixes inside one bucket. Which prefixes count as
//! experiments, who owns them and how they are shared is recorded in the
//! bucket's registry file. Every registry change is a read-modify-write held
//! under one mutex per bucket.

pub mod client;
pub mod registry;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use client::{BucketClient, BucketEntry, HttpBucketClient};
pub use registry::{ModelEntry, REGISTRY_FILE, Registry, RegistryEntry};

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

/// Top-level prefixes reserved for models and attachments.
const INTERNALS: [&str; 2] = ["models", "attachments"];
const FOLDER_CONTENT_TYPE: &str = "application/x-directory";

pub struct RemoteStorage {
    client: Arc<dyn BucketClient>,
    registry_lock: Mutex<()>,
}

impl RemoteStorage {
    pub fn new(client: Arc<dyn BucketClient>) -> Self {
        Self {
            client,
            registry_lock: Mutex::new(()),
        }
    }

    async fn load_registry(&self, token: &str) -> StorageResult<Registry> {
        match self.client.get(token, REGISTRY_FILE).await {
            Ok(bytes) if bytes.is_empty() => Ok(Registry::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(StorageError::NotFound(_)) => Ok(Registry::default()),
            Err(err) => Err(err),
        }
    }

    /// Apply `change` to the registry and write it back, holding the bucket
    /// lock for the whole round trip. Nothing is written when `change` fails.
    async fn update_registry<T, F>(&self, token: &str, change: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Registry) -> StorageResult<T> + Send,
        T: Send,
    {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry(token).await?;
        let result = change(&mut registry)?;
        let body = serde_json::to_vec_pretty(&registry)?;
        self.client
            .put(token, REGISTRY_FILE, Bytes::from(body), "application/json")
            .await?;
        debug!(
            experiments = registry.experiments.len(),
            models = registry.models.len(),
            "wrote registry"
        );
        Ok(result)
    }

    async fn experiment_access(&self, token: &str, name: &str) -> StorageResult<AccessRecord> {
        let registry = self.load_registry(token).await?;
        registry
            .experiment(name)
            .map(RegistryEntry::access)
            .ok_or_else(|| StorageError::NotFound(format!("experiment `{name}`")))
    }

    async fn authorize_path(&self, user: &UserContext, relative: &str) -> StorageResult<String> {
        let experiment = experiment_of(relative)?;
        let access = self.experiment_access(&user.token, &experiment).await?;
        access.ensure_access(&experiment, &user.user_id)?;
        Ok(experiment)
    }

    async fn model_entry(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<ModelEntry> {
        self.load_registry(token)
            .await?
            .model(model_type, name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{model_type} `{name}`")))
    }

    /// Turn a by-name locator into an object key by listing the containing
    /// folder.
    async fn resolve_locator(
        &self,
        token: &str,
        locator: FileLocator<'_>,
    ) -> StorageResult<String> {
        match locator {
            FileLocator::Id(id) => Ok(utils::join_key([id])),
            FileLocator::Name { experiment, name } => {
                let path = utils::join_key([experiment, name]);
                let (folder, file) = path.rsplit_once('/').unwrap_or((experiment, name));
                let prefix = format!("{folder}/");
                self.client
                    .list(token, &prefix)
                    .await?
                    .into_iter()
                    .find_map(|entry| match entry {
                        BucketEntry::Object { key, .. } if utils::basename(&key) == file => {
                            Some(key)
                        }
                        _ => None,
                    })
                    .ok_or_else(|| StorageError::NotFound(format!("file `{path}`")))
            }
        }
    }

    /// Every object key below `folder`, markers excluded.
    async fn walk_keys(&self, token: &str, folder: &str) -> StorageResult<Vec<String>> {
        Ok(self.walk(token, folder).await?.0)
    }

    /// Object keys and sub-folder prefixes below `folder`, both sorted.
    async fn walk(&self, token: &str, folder: &str) -> StorageResult<(Vec<String>, Vec<String>)> {
        let mut keys = Vec::new();
        let mut folders = Vec::new();
        let mut pending = vec![format!("{}/", utils::join_key([folder]))];
        while let Some(prefix) = pending.pop() {
            for entry in self.client.list(token, &prefix).await? {
                match entry {
                    BucketEntry::Prefix(sub) => {
                        folders.push(sub.clone());
                        pending.push(sub);
                    }
                    BucketEntry::Object { key, .. } if !key.ends_with('/') => keys.push(key),
                    BucketEntry::Object { .. } => {}
                }
            }
        }
        keys.sort();
        folders.sort();
        Ok((keys, folders))
    }

    async fn delete_tree(&self, token: &str, folder: &str) -> StorageResult<usize> {
        let (keys, folders) = self.walk(token, folder).await?;
        try_join_all(keys.iter().map(|key| self.client.delete(token, key))).await?;
        // Deepest markers first, then the folder's own.
        let markers = folders.into_iter().rev().chain([format!("{folder}/")]);
        for marker in markers {
            match self.client.delete(token, &marker).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(keys.len())
    }

    async fn load_root_config(
        &self,
        token: &str,
        experiment: &str,
    ) -> StorageResult<Option<(String, ExperimentConfig)>> {
        let prefix = format!("{experiment}/");
        let keys: Vec<String> = self
            .client
            .list(token, &prefix)
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                BucketEntry::Object { key, .. } => Some(key),
                BucketEntry::Prefix(_) => None,
            })
            .collect();
        let names: Vec<&str> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|name| !name.is_empty())
            .collect();
        let Some(config_name) = root_config_name(names) else {
            return Ok(None);
        };
        let key = format!("{prefix}{config_name}");
        let body = self.client.get(token, &key).await?;
        let config = ExperimentConfig::parse(config_name, &body)?;
        Ok(Some((key, config)))
    }

    async fn save_config(
        &self,
        token: &str,
        key: &str,
        config: &ExperimentConfig,
    ) -> StorageResult<()> {
        let content_type = utils::content_type_for(key);
        self.client
            .put(token, key, Bytes::from(config.root_bytes()?), &content_type)
            .await
    }

    async fn top_level_prefixes(&self, token: &str) -> StorageResult<BTreeSet<String>> {
        Ok(self
            .client
            .list(token, "")
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                BucketEntry::Prefix(prefix) => Some(prefix.trim_end_matches('/').to_string()),
                BucketEntry::Object { .. } => None,
            })
            .filter(|name| is_experiment_folder(name))
            .collect())
    }

    async fn models_matching<F>(
        &self,
        token: &str,
        model_type: ModelType,
        keep: F,
    ) -> StorageResult<Vec<ModelRecord>>
    where
        F: Fn(&AccessRecord) -> bool + Send,
    {
        Ok(self
            .load_registry(token)
            .await?
            .models
            .iter()
            .filter(|m| m.model_type == model_type && keep(&m.access()))
            .map(ModelEntry::to_record)
            .collect())
    }
}

fn is_experiment_folder(name: &str) -> bool {
    !INTERNALS.contains(&name) && !name.is_empty()
}

fn experiment_of(relative: &str) -> StorageResult<String> {
    let clean = utils::sanitize_relative_path(relative)?;
    let first = clean
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .ok_or_else(|| {
            StorageError::Validation(format!("`{relative}` does not name an experiment"))
        })?;
    if !is_experiment_folder(&first) {
        return Err(StorageError::forbidden(&first));
    }
    Ok(first)
}

/// Path a locator addresses, before any listing resolves it.
fn locator_path(locator: FileLocator<'_>) -> String {
    match locator {
        FileLocator::Id(id) => utils::join_key([id]),
        FileLocator::Name { experiment, name } => utils::join_key([experiment, name]),
    }
}

fn validate_experiment_name(name: &str) -> StorageResult<()> {
    let clean = utils::sanitize_relative_path(name)?;
    if clean.components().count() != 1 {
        return Err(StorageError::Validation(format!(
            "experiment name `{name}` must be a single folder name"
        )));
    }
    experiment_of(name).map(|_| ())
}

/// Unowned entries may be managed by anyone the bucket lets through.
fn ensure_manager(access: &AccessRecord, entity: &str, user_id: &str) -> StorageResult<()> {
    if access.owner_id.is_none() {
        return Ok(());
    }
    access.ensure_owner(entity, user_id)
}

fn registered<'a>(registry: &'a mut Registry, name: &str) -> StorageResult<&'a mut RegistryEntry> {
    registry
        .experiment_mut(name)
        .ok_or_else(|| StorageError::NotFound(format!("experiment `{name}`")))
}

fn registered_model<'a>(
    registry: &'a mut Registry,
    model_type: ModelType,
    name: &str,
) -> StorageResult<&'a mut ModelEntry> {
    registry
        .model_mut(model_type, name)
        .ok_or_else(|| StorageError::NotFound(format!("{model_type} `{name}`")))
}

fn remove_shared(list: &mut Vec<String>, target: &SharedUser) {
    match target {
        SharedUser::All => list.clear(),
        SharedUser::User(user) => list.retain(|u| u != user),
    }
}

fn add_shared(list: &mut Vec<String>, user: &str) {
    if !list.iter().any(|u| u == user) {
        list.push(user.to_string());
        list.sort();
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn list_files(&self, user: &UserContext, folder: &str) -> StorageResult<Vec<FileEntry>> {
        self.authorize_path(user, folder).await?;
        let prefix = format!("{}/", utils::join_key([folder]));
        let mut files: Vec<FileEntry> = self
            .client
            .list(&user.token, &prefix)
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                BucketEntry::Prefix(sub) => {
                    let uuid = sub.trim_end_matches('/').to_string();
                    Some(FileEntry {
                        name: utils::basename(&uuid).to_string(),
                        uuid,
                        size: 0,
                        entry_type: EntryType::Folder,
                        modified_on: None,
                    })
                }
                BucketEntry::Object { key, .. } if key.ends_with('/') => None,
                BucketEntry::Object {
                    key,
                    size,
                    last_modified,
                    ..
                } => Some(FileEntry {
                    name: utils::basename(&key).to_string(),
                    uuid: key,
                    size,
                    entry_type: EntryType::File,
                    modified_on: last_modified,
                }),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn get_file(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<FileContent> {
        self.authorize_path(user, &locator_path(locator)).await?;
        let key = self.resolve_locator(&user.token, locator).await?;
        let body = self.client.get(&user.token, &key).await?;
        Ok(FileContent {
            content_type: utils::content_type_for(&key),
            content_disposition: format!("attachment; filename={}", utils::basename(&key)),
            uuid: key,
            body,
        })
    }

    async fn delete_file(&self, user: &UserContext, locator: FileLocator<'_>) -> StorageResult<()> {
        self.authorize_path(user, &locator_path(locator)).await?;
        let key = self.resolve_locator(&user.token, locator).await?;
        self.client.delete(&user.token, &key).await
    }

    async fn delete_folder(
        &self,
        user: &UserContext,
        locator: FileLocator<'_>,
    ) -> StorageResult<()> {
        let folder = locator_path(locator);
        self.authorize_path(user, &folder).await?;
        let removed = self.delete_tree(&user.token, &folder).await?;
        debug!(folder = %folder, objects = removed, "removed folder");
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
        self.client
            .put(&user.token, &format!("{id}/"), Bytes::new(), FOLDER_CONTENT_TYPE)
            .await?;
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
        content_type: &str,
        mode: WriteMode,
    ) -> StorageResult<EntryRef> {
        let key = utils::join_key([experiment, file_name]);
        self.authorize_path(user, &key).await?;
        let body = match mode {
            WriteMode::Overwrite => content,
            WriteMode::Append => {
                let existing = match self.client.get(&user.token, &key).await {
                    Ok(existing) => existing,
                    Err(StorageError::NotFound(_)) => Bytes::new(),
                    Err(err) => return Err(err),
                };
                let mut joined = BytesMut::with_capacity(existing.len() + content.len());
                joined.extend_from_slice(&existing);
                joined.extend_from_slice(&content);
                joined.freeze()
            }
        };
        self.client.put(&user.token, &key, body, content_type).await?;
        Ok(EntryRef {
            name: utils::basename(&key).to_string(),
            uuid: key,
            entry_type: EntryType::File,
        })
    }

    /// Owned scope includes unowned registry entries; the bucket decides who
    /// may see those.
    async fn list_experiments(
        &self,
        user: &UserContext,
        scope: ListScope,
    ) -> StorageResult<Vec<ExperimentRef>> {
        let registry = self.load_registry(&user.token).await?;
        let mut names: Vec<String> = registry
            .experiments
            .iter()
            .filter(|entry| match scope {
                ListScope::All => true,
                ListScope::Owned => entry.owner.is_none() || entry.access().is_owner(&user.user_id),
            })
            .map(|entry| entry.path.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names.into_iter().map(ExperimentRef::named).collect())
    }

    async fn create_experiment(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<ExperimentRef> {
        validate_experiment_name(name)?;
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry(&user.token).await?;
        if registry.experiment(name).is_some() {
            return Err(StorageError::Conflict(format!("experiment `{name}`")));
        }
        self.client
            .put(&user.token, &format!("{name}/"), Bytes::new(), FOLDER_CONTENT_TYPE)
            .await?;
        registry
            .experiments
            .push(RegistryEntry::folder(name, &user.user_id));
        let body = serde_json::to_vec_pretty(&registry)?;
        self.client
            .put(&user.token, REGISTRY_FILE, Bytes::from(body), "application/json")
            .await?;
        info!(experiment = %name, owner = %user.user_id, "created experiment");
        Ok(ExperimentRef::named(name))
    }

    async fn delete_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()> {
        let experiment = experiment_of(name)?;
        let access = self.experiment_access(&user.token, &experiment).await?;
        ensure_manager(&access, &experiment, &user.user_id)?;

        let removed = self.delete_tree(&user.token, &experiment).await?;
        self.update_registry(&user.token, |registry| {
            registry.remove_experiment(&experiment);
            Ok(())
        })
        .await?;
        info!(experiment = %experiment, objects = removed, "deleted experiment");
        Ok(())
    }

    async fn copy_experiment(&self, user: &UserContext, name: &str) -> StorageResult<CloneResult> {
        let experiment = self.authorize_path(user, name).await?;
        let copied = self.create_unique_experiment_id(user, &experiment).await?;
        let clone_date = utils::current_time_and_date();

        let keys = self.walk_keys(&user.token, &experiment).await?;
        let source_prefix = format!("{experiment}/");
        try_join_all(keys.iter().map(|key| {
            let relative = key.strip_prefix(&source_prefix).unwrap_or(key);
            let new_key = format!("{copied}/{relative}");
            async move { self.client.copy(&user.token, key, &new_key).await }
        }))
        .await?;
        self.client
            .put(&user.token, &format!("{copied}/"), Bytes::new(), FOLDER_CONTENT_TYPE)
            .await?;

        if let Some((key, mut config)) = self.load_root_config(&user.token, &copied).await? {
            config.set_clone_date(&clone_date);
            self.save_config(&user.token, &key, &config).await?;
        }

        let owner = user.user_id.clone();
        let entry_name = copied.clone();
        self.update_registry(&user.token, move |registry| {
            if registry.experiment(&entry_name).is_some() {
                return Err(StorageError::Conflict(format!("experiment `{entry_name}`")));
            }
            let mut entry = RegistryEntry::folder(&entry_name, &owner);
            entry.clone_date = Some(clone_date);
            registry.experiments.push(entry);
            Ok(())
        })
        .await?;

        info!(from = %experiment, to = %copied, objects = keys.len(), "copied experiment");
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
        let Some((key, mut config)) = self.load_root_config(&user.token, &experiment).await? else {
            return Err(StorageError::NotFound(format!(
                "configuration of experiment `{experiment}`"
            )));
        };
        config.set_name(display_name);
        self.save_config(&user.token, &key, &config).await
    }

    async fn register_experiment(&self, user: &UserContext, name: &str) -> StorageResult<()> {
        validate_experiment_name(name)?;
        if self.client.list(&user.token, &format!("{name}/")).await?.is_empty() {
            return Err(StorageError::NotFound(format!("experiment folder `{name}`")));
        }
        let owner = user.user_id.clone();
        self.update_registry(&user.token, |registry| {
            if registry.experiment(name).is_some() {
                return Err(StorageError::Conflict(format!("experiment `{name}`")));
            }
            registry.experiments.push(RegistryEntry::folder(name, &owner));
            Ok(())
        })
        .await
    }

    async fn scan_storage(&self, user: &UserContext) -> StorageResult<ScanReport> {
        let prefixes = self.top_level_prefixes(&user.token).await?;
        let owner = user.user_id.clone();
        let report = self
            .update_registry(&user.token, move |registry| {
                let known: BTreeSet<String> =
                    registry.experiments.iter().map(|e| e.path.clone()).collect();
                let mut report = ScanReport::default();
                for prefix in prefixes.difference(&known) {
                    registry.experiments.push(RegistryEntry::folder(prefix, &owner));
                    report.added.push(prefix.clone());
                }
                for name in known.difference(&prefixes) {
                    if registry.remove_experiment(name) {
                        report.removed.push(name.clone());
                    }
                }
                Ok(report)
            })
            .await?;
        info!(added = report.added.len(), removed = report.removed.len(), "scanned bucket");
        Ok(report)
    }

    async fn get_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let access = self.experiment_access(&user.token, name).await?;
        access.ensure_access(name, &user.user_id)?;
        Ok(access.sharing_mode)
    }

    async fn update_experiment_sharing_mode(
        &self,
        user: &UserContext,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered(registry, name)?;
            ensure_manager(&entry.access(), name, &user.user_id)?;
            entry.sharing_mode = Some(mode);
            Ok(())
        })
        .await
    }

    async fn list_experiment_shared_users(
        &self,
        user: &UserContext,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let access = self.experiment_access(&user.token, name).await?;
        access.ensure_access(name, &user.user_id)?;
        Ok(access.shared_users.into_iter().collect())
    }

    async fn add_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered(registry, name)?;
            ensure_manager(&entry.access(), name, &user.user_id)?;
            add_shared(&mut entry.shared_users, shared_with);
            Ok(())
        })
        .await
    }

    async fn remove_experiment_shared_user(
        &self,
        user: &UserContext,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered(registry, name)?;
            ensure_manager(&entry.access(), name, &user.user_id)?;
            remove_shared(&mut entry.shared_users, &target);
            Ok(())
        })
        .await
    }

    async fn list_experiments_shared_with(
        &self,
        user: &UserContext,
    ) -> StorageResult<Vec<ExperimentRef>> {
        let registry = self.load_registry(&user.token).await?;
        Ok(registry
            .experiments
            .iter()
            .filter(|entry| entry.owner.is_some() && entry.access().is_shared_with(&user.user_id))
            .map(|entry| ExperimentRef::named(entry.path.clone()))
            .collect())
    }

    async fn create_custom_model(
        &self,
        user: &UserContext,
        metadata: &ModelMetadata,
        archive: Bytes,
    ) -> StorageResult<ModelRecord> {
        let model_type = metadata.model_type;
        if let Some(existing) = self
            .load_registry(&user.token)
            .await?
            .model(model_type, &metadata.name)
            && existing.owner.as_deref() != Some(user.user_id.as_str())
        {
            return Err(StorageError::Conflict(format!("{model_type} `{}`", metadata.name)));
        }

        let file_name = stored_archive_name(&metadata.name);
        utils::sanitize_relative_path(&file_name)?;
        let key = registry::model_key(model_type, &file_name);
        self.client
            .put(&user.token, &key, archive, "application/zip")
            .await?;

        let owner = user.user_id.clone();
        let name = metadata.name.clone();
        let entry = self
            .update_registry(&user.token, move |registry| {
                let previous = registry.model(model_type, &name).cloned();
                registry.remove_model(model_type, &name);
                let entry = ModelEntry {
                    model_type,
                    name,
                    file_name,
                    owner: Some(owner),
                    sharing_mode: previous.as_ref().and_then(|m| m.sharing_mode),
                    shared_users: previous.map(|m| m.shared_users).unwrap_or_default(),
                    is_custom: true,
                };
                registry.models.push(entry.clone());
                Ok(entry)
            })
            .await?;
        info!(model = %entry.name, %model_type, "stored custom model");
        Ok(entry.to_record())
    }

    async fn get_model_zip(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Bytes> {
        let entry = self.model_entry(&user.token, model_type, name).await?;
        entry.access().ensure_access(name, &user.user_id)?;
        self.client.get(&user.token, &entry.key()).await
    }

    async fn delete_custom_model(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<()> {
        let entry = self.model_entry(&user.token, model_type, name).await?;
        entry.access().ensure_owner(name, &user.user_id)?;
        match self.client.delete(&user.token, &entry.key()).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.update_registry(&user.token, |registry| {
            registry.remove_model(model_type, name);
            Ok(())
        })
        .await
    }

    async fn list_models_by_type(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(&user.token, model_type, |_| true).await
    }

    async fn list_user_models_by_type(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(&user.token, model_type, |access| access.is_owner(&user.user_id))
            .await
    }

    async fn list_shared_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(&user.token, model_type, |access| {
            access.owner_id.is_some() && access.is_shared_with(&user.user_id)
        })
        .await
    }

    async fn list_all_models(
        &self,
        user: &UserContext,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        self.models_matching(&user.token, model_type, |access| access.allows(&user.user_id))
            .await
    }

    async fn get_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let entry = self.model_entry(&user.token, model_type, name).await?;
        entry.access().ensure_access(name, &user.user_id)?;
        Ok(entry.sharing_mode.unwrap_or_default())
    }

    async fn update_model_sharing_mode(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered_model(registry, model_type, name)?;
            entry.access().ensure_owner(name, &user.user_id)?;
            entry.sharing_mode = Some(mode);
            Ok(())
        })
        .await
    }

    async fn list_model_shared_users(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let entry = self.model_entry(&user.token, model_type, name).await?;
        entry.access().ensure_access(name, &user.user_id)?;
        Ok(entry.shared_users)
    }

    async fn add_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered_model(registry, model_type, name)?;
            entry.access().ensure_owner(name, &user.user_id)?;
            add_shared(&mut entry.shared_users, shared_with);
            Ok(())
        })
        .await
    }

    async fn remove_model_shared_user(
        &self,
        user: &UserContext,
        model_type: ModelType,
        name: &str,
        target: SharedUser,
    ) -> StorageResult<()> {
        self.update_registry(&user.token, |registry| {
            let entry = registered_model(registry, model_type, name)?;
            entry.access().ensure_owner(name, &user.user_id)?;
            remove_shared(&mut entry.shared_users, &target);
            Ok(())
        })
        .await
    }

    /// Attachments are written with the service's own credentials, so no
    /// token is forwarded.
    async fn create_or_update_attachment(&self, name: &str, content: Bytes) -> StorageResult<()> {
        let key = attachment_key(name)?;
        self.client
            .put("", &key, content, &utils::content_type_for(name))
            .await
    }

    async fn get_attachment(&self, name: &str) -> StorageResult<Bytes> {
        self.client.get("", &attachment_key(name)?).await
    }

    async fn delete_attachment(&self, name: &str) -> StorageResult<()> {
        self.client.delete("", &attachment_key(name)?).await
    }
}

fn attachment_key(name: &str) -> StorageResult<String> {
    let clean = utils::join_key([name]);
    utils::sanitize_relative_path(&clean)?;
    Ok(format!("attachments/{clean}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    /// In-memory bucket; keys ending in `/` are folder markers.
    #[derive(Default)]
    pub(crate) struct MemoryBucket {
        pub objects: StdMutex<BTreeMap<String, Bytes>>,
    }

    #[async_trait]
    impl BucketClient for MemoryBucket {
        async fn list(&self, _token: &str, prefix: &str) -> StorageResult<Vec<BucketEntry>> {
            let objects = self.objects.lock().unwrap();
            let mut prefixes = BTreeSet::new();
            let mut entries = Vec::new();
            for (key, body) in objects.range(prefix.to_string()..) {
                let Some(rest) = key.strip_prefix(prefix) else {
                    break;
                };
                match rest.split_once('/') {
                    Some((dir, tail)) if !(dir.is_empty() && tail.is_empty()) => {
                        prefixes.insert(format!("{prefix}{dir}/"));
                    }
                    _ => entries.push(BucketEntry::Object {
                        key: key.clone(),
                        size: body.len() as u64,
                        content_type: None,
                        last_modified: None,
                    }),
                }
            }
            entries.extend(prefixes.into_iter().map(BucketEntry::Prefix));
            Ok(entries)
        }

        async fn get(&self, _token: &str, key: &str) -> StorageResult<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("object `{key}`")))
        }

        async fn put(&self, _token: &str, key: &str, body: Bytes, _ct: &str) -> StorageResult<()> {
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn delete(&self, _token: &str, key: &str) -> StorageResult<()> {
            self.objects
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(format!("object `{key}`")))
        }

        async fn copy(&self, _token: &str, key: &str, new_key: &str) -> StorageResult<()> {
            let mut objects = self.objects.lock().unwrap();
            let body = objects
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("object `{key}`")))?;
            objects.insert(new_key.to_string(), body);
            Ok(())
        }
    }

    fn remote() -> (Arc<MemoryBucket>, RemoteStorage) {
        let bucket = Arc::new(MemoryBucket::default());
        (bucket.clone(), RemoteStorage::new(bucket))
    }

    fn alice() -> UserContext {
        UserContext::new("token-a", "alice")
    }

    #[tokio::test]
    async fn create_registers_and_conflicts() {
        let (bucket, storage) = remote();
        storage.create_experiment(&alice(), "exp").await.unwrap();
        assert!(bucket.objects.lock().unwrap().contains_key("exp/"));
        assert_matches!(
            storage.create_experiment(&UserContext::new("t", "bob"), "exp").await,
            Err(StorageError::Conflict(_))
        );

        let registry = storage.load_registry("t").await.unwrap();
        assert_eq!(registry.experiment("exp").unwrap().owner.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn files_round_trip_and_list_by_prefix() {
        let (_bucket, storage) = remote();
        let user = alice();
        storage.create_experiment(&user, "exp").await.unwrap();
        storage
            .create_or_update(
                &user,
                "exp",
                "sub/a.json",
                Bytes::from_static(b"{}"),
                "application/json",
                WriteMode::Overwrite,
            )
            .await
            .unwrap();
        storage
            .create_or_update(
                &user,
                "exp",
                "log.txt",
                Bytes::from_static(b"1"),
                "text/plain",
                WriteMode::Append,
            )
            .await
            .unwrap();
        storage
            .create_or_update(
                &user,
                "exp",
                "log.txt",
                Bytes::from_static(b"2"),
                "text/plain",
                WriteMode::Append,
            )
            .await
            .unwrap();

        let listing = storage.list_files(&user, "exp").await.unwrap();
        let names: Vec<(&str, bool)> = listing
            .iter()
            .map(|f| (f.name.as_str(), f.is_folder()))
            .collect();
        assert_eq!(names, vec![("log.txt", false), ("sub", true)]);

        let log = storage
            .get_file(&user, FileLocator::Name { experiment: "exp", name: "log.txt" })
            .await
            .unwrap();
        assert_eq!(log.body.as_ref(), b"12");
        let nested = storage.get_file(&user, FileLocator::Id("exp/sub/a.json")).await.unwrap();
        assert_eq!(nested.content_type, "application/json");

        storage
            .delete_folder(&user, FileLocator::Id("exp/sub"))
            .await
            .unwrap();
        assert_matches!(
            storage.get_file(&user, FileLocator::Id("exp/sub/a.json")).await,
            Err(StorageError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn copy_rewrites_config_and_appends_registry() {
        let (bucket, storage) = remote();
        let user = alice();
        storage.create_experiment(&user, "exp").await.unwrap();
        storage
            .create_or_update(
                &user,
                "exp",
                "simulation_config.json",
                Bytes::from_static(br#"{"SimulationName":"orig"}"#),
                "application/json",
                WriteMode::Overwrite,
            )
            .await
            .unwrap();

        let result = storage.copy_experiment(&user, "exp").await.unwrap();
        assert_eq!(result.cloned_exp, "exp_0");

        let body = bucket.objects.lock().unwrap()["exp_0/simulation_config.json"].clone();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["SimulationName"], "orig");
        assert!(value["CloneDate"].is_string());

        let names = storage.list_experiments(&user, ListScope::Owned).await.unwrap();
        assert_eq!(names, vec![ExperimentRef::named("exp"), ExperimentRef::named("exp_0")]);
    }

    #[tokio::test]
    async fn sharing_is_recorded_in_registry() {
        let (_bucket, storage) = remote();
        let (owner, friend) = (alice(), UserContext::new("t", "bob"));
        storage.create_experiment(&owner, "exp").await.unwrap();
        assert_matches!(
            storage.list_files(&friend, "exp").await,
            Err(StorageError::Authorization(_))
        );
        assert_matches!(
            storage.add_experiment_shared_user(&friend, "exp", "bob").await,
            Err(StorageError::Authorization(_))
        );

        storage.add_experiment_shared_user(&owner, "exp", "bob").await.unwrap();
        storage
            .update_experiment_sharing_mode(&owner, "exp", SharingMode::Shared)
            .await
            .unwrap();
        assert!(storage.list_files(&friend, "exp").await.is_ok());
        assert_eq!(
            storage.list_experiments_shared_with(&friend).await.unwrap(),
            vec![ExperimentRef::named("exp")]
        );
        assert_eq!(
            storage.list_experiment_shared_users(&owner, "exp").await.unwrap(),
            vec!["bob".to_string()]
        );
    }

    #[tokio::test]
    async fn registry_writes_are_serialized() {
        let (_bucket, storage) = remote();
        let storage = Arc::new(storage);
        let user = alice();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                let user = user.clone();
                tokio::spawn(
                    async move { storage.create_experiment(&user, &format!("exp{i}")).await },
                )
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let listed = storage.list_experiments(&user, ListScope::All).await.unwrap();
        assert_eq!(listed.len(), 8);
    }

    #[tokio::test]
    async fn scan_reconciles_prefixes() {
        let (bucket, storage) = remote();
        let user = alice();
        storage.create_experiment(&user, "gone").await.unwrap();
        bucket.objects.lock().unwrap().remove("gone/");
        bucket
            .objects
            .lock()
            .unwrap()
            .insert("dropped/config.json".into(), Bytes::from_static(b"{}"));
        bucket
            .objects
            .lock()
            .unwrap()
            .insert("models/robots/r.zip".into(), Bytes::from_static(b"PK"));

        let report = storage.scan_storage(&user).await.unwrap();
        assert_eq!(report.added, vec!["dropped".to_string()]);
        assert_eq!(report.removed, vec!["gone".to_string()]);
    }

    fn robot(name: &str, file_name: &str) -> ModelMetadata {
        ModelMetadata {
            name: name.into(),
            display_name: name.into(),
            owner_id: None,
            model_type: ModelType::Robot,
            file_name: file_name.into(),
            is_shared: false,
            is_custom: true,
            description: None,
            thumbnail: None,
            path: name.into(),
            script: None,
            sdf: None,
            config_path: format!("{name}/model.config"),
        }
    }

    #[tokio::test]
    async fn model_archives_are_keyed_by_model_name() {
        let (bucket, storage) = remote();
        let bob = UserContext::new("t", "bob");
        storage
            .create_custom_model(
                &alice(),
                &robot("alice_bot", "robot.zip"),
                Bytes::from_static(b"A"),
            )
            .await
            .unwrap();
        let record = storage
            .create_custom_model(&bob, &robot("bob_bot", "robot.zip"), Bytes::from_static(b"B"))
            .await
            .unwrap();
        assert_eq!(record.file_name, "bob_bot.zip");
        assert!(bucket.objects.lock().unwrap().contains_key("models/robots/alice_bot.zip"));

        let alice_zip = storage
            .get_model_zip(&alice(), ModelType::Robot, "alice_bot")
            .await
            .unwrap();
        assert_eq!(alice_zip.as_ref(), b"A");
    }

    #[tokio::test]
    async fn missing_files_are_not_revealed_to_strangers() {
        let (_bucket, storage) = remote();
        let stranger = UserContext::new("t", "bob");
        storage.create_experiment(&alice(), "exp").await.unwrap();

        let missing = FileLocator::Name { experiment: "exp", name: "absent.txt" };
        assert_matches!(
            storage.get_file(&stranger, missing).await,
            Err(StorageError::Authorization(_))
        );
        assert_matches!(
            storage.delete_file(&stranger, missing).await,
            Err(StorageError::Authorization(_))
        );
        assert_matches!(
            storage.get_file(&alice(), missing).await,
            Err(StorageError::NotFound(_))
        );
    }
}
