//! Where a clone reads its template from.

use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::VecDeque, io::ErrorKind, path::PathBuf, sync::Arc};
use tokio::fs;

use crate::{
    errors::{StorageError, StorageResult},
    models::{FileLocator, UserContext},
    services::storage::Storage,
    utils,
};

/// Read access to a template experiment and to the models library.
///
/// Paths are `/` separated and relative: to the experiment folder for
/// `list_files`/`read_file`, to the models root for the model methods.
#[async_trait]
pub trait CloneSource: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    /// Every file of `experiment`, recursively, relative to its folder.
    async fn list_files(&self, experiment: &str) -> StorageResult<Vec<String>>;

    async fn read_file(&self, experiment: &str, path: &str) -> StorageResult<Bytes>;

    async fn read_model_file(&self, path: &str) -> StorageResult<Bytes>;

    /// File names directly inside a models library folder.
    async fn list_model_dir(&self, dir: &str) -> StorageResult<Vec<String>>;
}

async fn read_under(root: &std::path::Path, path: &str) -> StorageResult<Bytes> {
    let full = root.join(utils::sanitize_relative_path(path)?);
    match fs::read(&full).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(StorageError::NotFound(format!("file `{path}`")))
        }
        Err(err) => Err(StorageError::Io(err)),
    }
}

async fn list_dir_files(root: &std::path::Path, dir: &str) -> StorageResult<Vec<String>> {
    let full = root.join(utils::sanitize_relative_path(dir)?);
    let mut entries = match fs::read_dir(&full).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageError::Io(err)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Bundled templates on local disk.
#[derive(Clone, Debug)]
pub struct TemplateLibrary {
    pub templates_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl TemplateLibrary {
    pub fn new(templates_dir: impl Into<PathBuf>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            models_dir: models_dir.into(),
        }
    }
}

#[async_trait]
impl CloneSource for TemplateLibrary {
    fn describe(&self) -> String {
        format!("templates at {}", self.templates_dir.display())
    }

    async fn list_files(&self, experiment: &str) -> StorageResult<Vec<String>> {
        let dir = self
            .templates_dir
            .join(utils::sanitize_relative_path(experiment)?);
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound(format!("template `{experiment}`")));
        }
        tokio::task::spawn_blocking(move || utils::walk_files(&dir))
            .await
            .map_err(|err| StorageError::Inconsistency(format!("directory walk panicked: {err}")))?
    }

    async fn read_file(&self, experiment: &str, path: &str) -> StorageResult<Bytes> {
        read_under(&self.templates_dir, &utils::join_key([experiment, path])).await
    }

    async fn read_model_file(&self, path: &str) -> StorageResult<Bytes> {
        read_under(&self.models_dir, path).await
    }

    async fn list_model_dir(&self, dir: &str) -> StorageResult<Vec<String>> {
        list_dir_files(&self.models_dir, dir).await
    }
}

/// An experiment already in storage, read on behalf of `user`.
#[derive(Clone)]
pub struct StoredExperiment {
    pub storage: Arc<dyn Storage>,
    pub user: UserContext,
    /// Models library for references that point outside the experiment.
    pub models_dir: Option<PathBuf>,
}

impl StoredExperiment {
    pub fn new(storage: Arc<dyn Storage>, user: UserContext, models_dir: Option<PathBuf>) -> Self {
        Self {
            storage,
            user,
            models_dir,
        }
    }

    fn models_dir(&self, path: &str) -> StorageResult<&std::path::Path> {
        self.models_dir
            .as_deref()
            .ok_or_else(|| StorageError::NotFound(format!("model file `{path}`")))
    }
}

#[async_trait]
impl CloneSource for StoredExperiment {
    fn describe(&self) -> String {
        format!("stored experiments of {}", self.user.user_id)
    }

    async fn list_files(&self, experiment: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{}/", utils::join_key([experiment]));
        let mut files = Vec::new();
        let mut pending = VecDeque::from([experiment.to_string()]);
        while let Some(folder) = pending.pop_front() {
            for entry in self.storage.list_files(&self.user, &folder).await? {
                if entry.is_folder() {
                    pending.push_back(entry.uuid);
                } else if let Some(relative) = entry.uuid.strip_prefix(&prefix) {
                    files.push(relative.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_file(&self, experiment: &str, path: &str) -> StorageResult<Bytes> {
        let id = utils::join_key([experiment, path]);
        let file = self.storage.get_file(&self.user, FileLocator::Id(&id)).await?;
        Ok(file.body)
    }

    async fn read_model_file(&self, path: &str) -> StorageResult<Bytes> {
        read_under(self.models_dir(path)?, path).await
    }

    async fn list_model_dir(&self, dir: &str) -> StorageResult<Vec<String>> {
        match &self.models_dir {
            Some(root) => list_dir_files(root, dir).await,
            None => Ok(Vec::new()),
        }
    }
}
