//! Zipped experiment import and export.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    cloner::{CloneSource, StoredExperiment},
    storage::Storage,
};
use crate::{
    errors::{StorageError, StorageResult},
    models::{ImportResult, ScanReport, UserContext},
    utils,
};

pub const IMPORT_SUCCESS: &str = "The experiment folder has been succesfully imported";

/// Imports experiments packaged as a zip with a single root folder.
#[derive(Clone)]
pub struct ExperimentImporter {
    storage: Arc<dyn Storage>,
}

impl ExperimentImporter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Import `archive` under a fresh name derived from its root folder.
    ///
    /// The archive is validated before anything is written.
    pub async fn register_zipped_experiment(
        &self,
        user: &UserContext,
        archive: Bytes,
    ) -> StorageResult<ImportResult> {
        let zip_base_folder_name = import_root(archive.clone()).await?;
        let dest_folder_name = self
            .storage
            .create_unique_experiment_id(user, &zip_base_folder_name)
            .await?;

        self.storage.create_experiment(user, &dest_folder_name).await?;
        let written = self
            .storage
            .extract_zip(user, archive, &dest_folder_name)
            .await?;

        match self
            .storage
            .rename_experiment(user, &dest_folder_name, &dest_folder_name)
            .await
        {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        info!(
            from = %zip_base_folder_name,
            to = %dest_folder_name,
            files = written.len(),
            "imported experiment"
        );
        Ok(ImportResult {
            message: IMPORT_SUCCESS.to_string(),
            zip_base_folder_name,
            dest_folder_name,
        })
    }

    pub async fn scan_storage(&self, user: &UserContext) -> StorageResult<ScanReport> {
        self.storage.scan_storage(user).await
    }
}

/// The single root folder of an import archive.
async fn import_root(archive: Bytes) -> StorageResult<String> {
    let entries = tokio::task::spawn_blocking(move || utils::read_zip_entries(&archive))
        .await
        .map_err(|err| StorageError::Inconsistency(format!("zip reader panicked: {err}")))??;
    let roots = utils::zip_root_folders(entries.iter().map(|(name, _)| name.as_str()));
    let mut roots = roots.into_iter();
    match (roots.next(), roots.next()) {
        (None, _) => Err(StorageError::Validation(
            "Import error: the provided zip does contains no non-empty root folder. A non-empty \
             experiment root folder is expected."
                .to_string(),
        )),
        (Some(_), Some(_)) => Err(StorageError::Validation(
            "Import error: the provided zip contains multiple folders at the root level. A unique \
             experiment root folder is expected."
                .to_string(),
        )),
        (Some(root), None) => Ok(root),
    }
}

/// Packs an experiment into a zip whose root folder is the experiment id.
#[derive(Clone)]
pub struct ExperimentZipper {
    storage: Arc<dyn Storage>,
}

impl ExperimentZipper {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn zip_experiment(
        &self,
        user: &UserContext,
        experiment: &str,
    ) -> StorageResult<Bytes> {
        let source = StoredExperiment::new(self.storage.clone(), user.clone(), None);
        let files = source.list_files(experiment).await?;

        let mut members = Vec::with_capacity(files.len());
        for file in &files {
            let data = source.read_file(experiment, file).await?;
            members.push((utils::join_key([experiment, file.as_str()]), data));
        }
        debug!(experiment, files = members.len(), "zipping experiment");

        let archive = tokio::task::spawn_blocking(move || {
            utils::build_zip(members.iter().map(|(name, data)| (name.as_str(), data.as_ref())))
        })
        .await
        .map_err(|err| StorageError::Inconsistency(format!("zip writer panicked: {err}")))??;
        Ok(Bytes::from(archive))
    }
}
