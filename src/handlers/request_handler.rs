//! Request façade over a storage backend.
//!
//! [`RequestHandler`] validates the caller's token, resolves it to a user id
//! (cached per token for the life of the handler) and forwards the call to
//! the configured [`Storage`]. It also hosts the operations that combine
//! several storage calls:
//!
//! - experiment listings merging owned and shared experiments
//! - model listings enriched with archive metadata
//! - template cloning, zip import, and zip export

use bytes::Bytes;
use futures::future::{join_all, try_join_all};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

use super::auth::{Authenticator, IdentityProvider};
use crate::{
    errors::{StorageError, StorageResult},
    models::{
        CloneResult, DecoratedExperiment, EntryRef, ExperimentRef, ExperimentSummary, FileContent,
        FileEntry, FileLocator, ImportResult, ListScope, ModelDescriptor, ModelMetadata,
        ModelRecord, ModelType, ScanReport, SharedUser, SharingMode, UserContext, WriteMode,
    },
    services::{
        ExperimentCloner, ExperimentConfig, ExperimentImporter, ExperimentZipper, Storage,
        TemplateLibrary, cloner::config::root_config_name, custom_models,
    },
};

/// Folder names hidden from unfiltered experiment listings.
const SPECIAL_FOLDERS: [&str; 3] = ["robots", "brains", "environments"];

/// Options of [`RequestHandler::list_experiments`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only return the experiment with this exact name.
    pub filter: Option<String>,
    /// Attach a summary of each experiment's root configuration.
    pub decorate: bool,
}

pub struct RequestHandler {
    storage: Arc<dyn Storage>,
    authenticator: Arc<dyn Authenticator>,
    identity: Arc<dyn IdentityProvider>,
    templates: Option<TemplateLibrary>,
    user_ids: RwLock<HashMap<String, String>>,
}

impl RequestHandler {
    pub fn new(
        storage: Arc<dyn Storage>,
        authenticator: Arc<dyn Authenticator>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            storage,
            authenticator,
            identity,
            templates: None,
            user_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Enable template cloning from a local template library.
    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// User id behind `token`, asking the identity provider once per token.
    pub async fn user_identifier(&self, token: &str) -> StorageResult<String> {
        if let Some(user_id) = self.user_ids.read().await.get(token) {
            return Ok(user_id.clone());
        }
        let identity = self.identity.identity(token).await?;
        self.user_ids
            .write()
            .await
            .insert(token.to_string(), identity.user_id.clone());
        debug!(user = %identity.user_id, "resolved identity");
        Ok(identity.user_id)
    }

    async fn user(&self, token: &str) -> StorageResult<UserContext> {
        self.authenticator.check_token(token).await?;
        let user_id = self.user_identifier(token).await?;
        Ok(UserContext::new(token, user_id))
    }

    // --- files ---

    pub async fn list_files(&self, token: &str, folder: &str) -> StorageResult<Vec<FileEntry>> {
        let user = self.user(token).await?;
        self.storage.list_files(&user, folder).await
    }

    pub async fn get_file(
        &self,
        token: &str,
        locator: FileLocator<'_>,
    ) -> StorageResult<FileContent> {
        let user = self.user(token).await?;
        self.storage.get_file(&user, locator).await
    }

    pub async fn delete_file(&self, token: &str, locator: FileLocator<'_>) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.delete_file(&user, locator).await
    }

    pub async fn delete_folder(&self, token: &str, locator: FileLocator<'_>) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.delete_folder(&user, locator).await
    }

    pub async fn create_folder(
        &self,
        token: &str,
        parent: &str,
        name: &str,
    ) -> StorageResult<EntryRef> {
        let user = self.user(token).await?;
        self.storage.create_folder(&user, parent, name).await
    }

    pub async fn create_or_update(
        &self,
        token: &str,
        experiment: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        append: bool,
    ) -> StorageResult<EntryRef> {
        let user = self.user(token).await?;
        let mode = if append {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        };
        self.storage
            .create_or_update(&user, experiment, file_name, content, content_type, mode)
            .await
    }

    /// Unpack an archive into an existing experiment.
    pub async fn unzip(
        &self,
        token: &str,
        experiment: &str,
        archive: Bytes,
    ) -> StorageResult<Vec<String>> {
        let user = self.user(token).await?;
        self.storage.extract_zip(&user, archive, experiment).await
    }

    // --- experiments ---

    /// Owned experiments followed by the ones shared with the caller.
    ///
    /// With a filter only the experiment of that name is kept; otherwise the
    /// model folders are hidden.
    pub async fn list_experiments(
        &self,
        token: &str,
        options: &ListOptions,
    ) -> StorageResult<Vec<DecoratedExperiment>> {
        let user = self.user(token).await?;
        let owned = self.storage.list_experiments(&user, ListScope::Owned).await?;
        let shared = self.storage.list_experiments_shared_with(&user).await?;

        let experiments: Vec<DecoratedExperiment> = owned
            .into_iter()
            .map(|exp| DecoratedExperiment::new(exp, true))
            .chain(shared.into_iter().map(|exp| DecoratedExperiment::new(exp, false)))
            .filter(|exp| match &options.filter {
                Some(name) => &exp.name == name,
                None => !SPECIAL_FOLDERS.contains(&exp.name.as_str()),
            })
            .collect();

        if !options.decorate {
            return Ok(experiments);
        }
        Ok(join_all(experiments.into_iter().map(|mut exp| {
            let user = &user;
            async move {
                exp.configuration = self.summarize(user, &exp.uuid).await;
                exp
            }
        }))
        .await)
    }

    /// Summary of an experiment's root configuration, if it has a readable one.
    async fn summarize(&self, user: &UserContext, experiment: &str) -> Option<ExperimentSummary> {
        let result: StorageResult<Option<ExperimentSummary>> = async {
            let files = self.storage.list_files(user, experiment).await?;
            let names: Vec<&str> = files
                .iter()
                .filter(|f| !f.is_folder())
                .map(|f| f.name.as_str())
                .collect();
            let Some(config_name) = root_config_name(names) else {
                return Ok(None);
            };
            let file = self
                .storage
                .get_file(user, FileLocator::Name { experiment, name: config_name })
                .await?;
            let config = ExperimentConfig::parse(config_name, &file.body)?;
            Ok(Some(config.summary(config_name)))
        }
        .await;
        match result {
            Ok(summary) => summary,
            Err(err) => {
                debug!(experiment, error = %err, "experiment configuration unreadable");
                None
            }
        }
    }

    pub async fn create_experiment(&self, token: &str, name: &str) -> StorageResult<ExperimentRef> {
        let user = self.user(token).await?;
        self.storage.create_experiment(&user, name).await
    }

    pub async fn delete_experiment(&self, token: &str, name: &str) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.delete_experiment(&user, name).await
    }

    pub async fn copy_experiment(&self, token: &str, name: &str) -> StorageResult<CloneResult> {
        let user = self.user(token).await?;
        self.storage.copy_experiment(&user, name).await
    }

    pub async fn rename_experiment(
        &self,
        token: &str,
        name: &str,
        display_name: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.rename_experiment(&user, name, display_name).await
    }

    /// Clone a bundled template, returning the new experiment id.
    pub async fn clone_experiment(
        &self,
        token: &str,
        template: &str,
        display_name: Option<&str>,
    ) -> StorageResult<String> {
        let user = self.user(token).await?;
        let templates = self.templates.as_ref().ok_or_else(|| {
            StorageError::Validation("no template library is configured".to_string())
        })?;
        ExperimentCloner::new(self.storage.clone())
            .clone_experiment(&user, templates, template, display_name)
            .await
    }

    pub async fn register_zipped_experiment(
        &self,
        token: &str,
        archive: Bytes,
    ) -> StorageResult<ImportResult> {
        let user = self.user(token).await?;
        ExperimentImporter::new(self.storage.clone())
            .register_zipped_experiment(&user, archive)
            .await
    }

    pub async fn scan_storage(&self, token: &str) -> StorageResult<ScanReport> {
        let user = self.user(token).await?;
        ExperimentImporter::new(self.storage.clone())
            .scan_storage(&user)
            .await
    }

    pub async fn zip_experiment(&self, token: &str, experiment: &str) -> StorageResult<Bytes> {
        let user = self.user(token).await?;
        ExperimentZipper::new(self.storage.clone())
            .zip_experiment(&user, experiment)
            .await
    }

    // --- experiment sharing ---

    pub async fn get_experiment_sharing_mode(
        &self,
        token: &str,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let user = self.user(token).await?;
        self.storage.get_experiment_sharing_mode(&user, name).await
    }

    pub async fn update_experiment_sharing_mode(
        &self,
        token: &str,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.update_experiment_sharing_mode(&user, name, mode).await
    }

    pub async fn list_experiment_shared_users(
        &self,
        token: &str,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let user = self.user(token).await?;
        self.storage.list_experiment_shared_users(&user, name).await
    }

    pub async fn add_experiment_shared_user(
        &self,
        token: &str,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.add_experiment_shared_user(&user, name, shared_with).await
    }

    /// `shared_with` is a user id, or `"all"` to clear the list.
    pub async fn remove_experiment_shared_user(
        &self,
        token: &str,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage
            .remove_experiment_shared_user(&user, name, SharedUser::parse(shared_with))
            .await
    }

    pub async fn list_experiments_shared_with(
        &self,
        token: &str,
    ) -> StorageResult<Vec<ExperimentRef>> {
        let user = self.user(token).await?;
        self.storage.list_experiments_shared_with(&user).await
    }

    // --- models ---

    /// Validate an uploaded archive and store it as a custom model.
    pub async fn create_custom_model(
        &self,
        token: &str,
        model_type: ModelType,
        file_name: &str,
        archive: Bytes,
    ) -> StorageResult<ModelRecord> {
        let user = self.user(token).await?;
        let descriptor = ModelDescriptor {
            owner_id: Some(user.user_id.clone()),
            model_type,
            path: format!("{}/{file_name}", model_type.folder()),
            is_shared: false,
            is_custom: true,
        };
        let metadata = model_metadata(descriptor, archive.clone()).await?;
        self.storage.create_custom_model(&user, &metadata, archive).await
    }

    pub async fn get_model_zip(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Bytes> {
        let user = self.user(token).await?;
        self.storage.get_model_zip(&user, model_type, name).await
    }

    pub async fn delete_custom_model(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage.delete_custom_model(&user, model_type, name).await
    }

    pub async fn list_models_by_type(
        &self,
        token: &str,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelRecord>> {
        let user = self.user(token).await?;
        self.storage.list_models_by_type(&user, model_type).await
    }

    pub async fn list_user_models_by_type(
        &self,
        token: &str,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelMetadata>> {
        let user = self.user(token).await?;
        let records = self.storage.list_user_models_by_type(&user, model_type).await?;
        self.with_metadata(&user, records).await
    }

    pub async fn list_shared_models(
        &self,
        token: &str,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelMetadata>> {
        let user = self.user(token).await?;
        let records = self.storage.list_shared_models(&user, model_type).await?;
        self.with_metadata(&user, records).await
    }

    pub async fn list_all_models(
        &self,
        token: &str,
        model_type: ModelType,
    ) -> StorageResult<Vec<ModelMetadata>> {
        let user = self.user(token).await?;
        let records = self.storage.list_all_models(&user, model_type).await?;
        self.with_metadata(&user, records).await
    }

    async fn with_metadata(
        &self,
        user: &UserContext,
        records: Vec<ModelRecord>,
    ) -> StorageResult<Vec<ModelMetadata>> {
        try_join_all(records.iter().map(|record| async move {
            let archive = self
                .storage
                .get_model_zip(user, record.model_type, &record.name)
                .await?;
            model_metadata(ModelDescriptor::from(record), archive).await
        }))
        .await
    }

    // --- model sharing ---

    pub async fn get_model_sharing_mode(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<SharingMode> {
        let user = self.user(token).await?;
        self.storage.get_model_sharing_mode(&user, model_type, name).await
    }

    pub async fn update_model_sharing_mode(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
        mode: SharingMode,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage
            .update_model_sharing_mode(&user, model_type, name, mode)
            .await
    }

    pub async fn list_model_shared_users(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
    ) -> StorageResult<Vec<String>> {
        let user = self.user(token).await?;
        self.storage.list_model_shared_users(&user, model_type, name).await
    }

    pub async fn add_model_shared_user(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage
            .add_model_shared_user(&user, model_type, name, shared_with)
            .await
    }

    pub async fn remove_model_shared_user(
        &self,
        token: &str,
        model_type: ModelType,
        name: &str,
        shared_with: &str,
    ) -> StorageResult<()> {
        let user = self.user(token).await?;
        self.storage
            .remove_model_shared_user(&user, model_type, name, SharedUser::parse(shared_with))
            .await
    }

    // --- attachments ---

    pub async fn create_or_update_attachment(
        &self,
        name: &str,
        content: Bytes,
    ) -> StorageResult<()> {
        self.storage.create_or_update_attachment(name, content).await
    }

    pub async fn get_attachment(&self, name: &str) -> StorageResult<Bytes> {
        self.storage.get_attachment(name).await
    }

    pub async fn delete_attachment(&self, name: &str) -> StorageResult<()> {
        self.storage.delete_attachment(name).await
    }
}

/// Archive inspection is CPU bound, so it runs off the async workers.
async fn model_metadata(
    descriptor: ModelDescriptor,
    archive: Bytes,
) -> StorageResult<ModelMetadata> {
    tokio::task::spawn_blocking(move || {
        custom_models::get_zip_model_metadata(&descriptor, &archive)
    })
    .await
    .map_err(|err| StorageError::Inconsistency(format!("archive inspection panicked: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::auth::TrustedIdentity,
        models::Identity,
        services::{LocalStorage, MetadataStore},
        utils,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingIdentity {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityProvider for CountingIdentity {
        async fn identity(&self, token: &str) -> StorageResult<Identity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Identity {
                user_id: format!("user-{token}"),
                display_name: token.to_string(),
            })
        }
    }

    async fn handler() -> (tempfile::TempDir, RequestHandler) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let storage = LocalStorage::new(store, dir.path(), dir.path().join("USER_DATA"));
        let handler = RequestHandler::new(
            Arc::new(storage),
            Arc::new(TrustedIdentity),
            Arc::new(TrustedIdentity),
        );
        (dir, handler)
    }

    #[tokio::test]
    async fn identities_are_cached_per_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let identity = Arc::new(CountingIdentity::default());
        let handler = RequestHandler::new(
            Arc::new(LocalStorage::new(store, dir.path(), dir.path().join("USER_DATA"))),
            Arc::new(TrustedIdentity),
            identity.clone(),
        );
        assert_eq!(handler.user_identifier("abc").await.unwrap(), "user-abc");
        assert_eq!(handler.user_identifier("abc").await.unwrap(), "user-abc");
        handler.user_identifier("xyz").await.unwrap();
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listing_merges_owned_and_shared() {
        let (_dir, handler) = handler().await;
        handler.create_experiment("alice", "mine").await.unwrap();
        handler.create_experiment("alice", "robots").await.unwrap();
        handler.create_experiment("bob", "theirs").await.unwrap();
        handler
            .update_experiment_sharing_mode("bob", "theirs", SharingMode::Public)
            .await
            .unwrap();
        handler
            .create_or_update(
                "alice",
                "mine",
                "simulation_config.json",
                Bytes::from_static(br#"{"SimulationName":"Mine","SimulationDescription":"desc"}"#),
                "application/json",
                false,
            )
            .await
            .unwrap();

        let options = ListOptions {
            filter: None,
            decorate: true,
        };
        let listed = handler.list_experiments("alice", &options).await.unwrap();
        let names: Vec<(&str, bool)> = listed.iter().map(|e| (e.name.as_str(), e.owned)).collect();
        assert_eq!(names, vec![("mine", true), ("theirs", false)]);
        let summary = listed[0].configuration.as_ref().unwrap();
        assert_eq!(summary.description.as_deref(), Some("desc"));
        assert!(listed[1].configuration.is_none());

        let filtered = handler
            .list_experiments(
                "alice",
                &ListOptions {
                    filter: Some("robots".into()),
                    decorate: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "robots");
    }

    #[tokio::test]
    async fn custom_models_are_listed_with_metadata() {
        let (_dir, handler) = handler().await;
        let archive = utils::build_zip([
            (
                "husky/model.config",
                b"<model><name>Husky Bot</name><sdf>model.sdf</sdf></model>".as_slice(),
            ),
            ("husky/model.sdf", b"<sdf/>".as_slice()),
        ])
        .unwrap();
        let record = handler
            .create_custom_model("alice", ModelType::Robot, "husky.zip", Bytes::from(archive))
            .await
            .unwrap();
        assert_eq!(record.name, "husky_bot");

        let mine = handler.list_user_models_by_type("alice", ModelType::Robot).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].display_name, "Husky Bot");
        assert!(handler.list_shared_models("bob", ModelType::Robot).await.unwrap().is_empty());

        handler
            .add_model_shared_user("alice", ModelType::Robot, "husky_bot", "bob")
            .await
            .unwrap();
        handler
            .update_model_sharing_mode("alice", ModelType::Robot, "husky_bot", SharingMode::Shared)
            .await
            .unwrap();
        let shared = handler.list_shared_models("bob", ModelType::Robot).await.unwrap();
        assert_eq!(shared[0].sdf.as_deref(), Some("husky/model.sdf"));
    }

    #[tokio::test]
    async fn empty_tokens_are_rejected() {
        let (_dir, handler) = handler().await;
        assert_matches!(
            handler.list_files("", "exp").await,
            Err(StorageError::Authorization(_))
        );
        assert_matches!(
            handler.clone_experiment("alice", "husky", None).await,
            Err(StorageError::Validation(_))
        );
    }
}
