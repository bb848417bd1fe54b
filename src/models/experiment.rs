//! Experiments as seen by callers of the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sharing::SharingMode;

/// Minimal handle on an experiment: its storage id and its name.
///
/// Both backends use the folder (or prefix) name as the id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExperimentRef {
    pub uuid: String,
    pub name: String,
}

impl ExperimentRef {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uuid: name.clone(),
            name,
        }
    }
}

/// Metadata row kept for every registered experiment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub name: String,
    pub owner_id: String,
    pub sharing_mode: SharingMode,
    pub shared_user_ids: Vec<String>,
    pub clone_date: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a copy: the new experiment and the one it was copied from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneResult {
    pub cloned_exp: String,
    pub original_exp: String,
}

/// Which experiments `list_experiments` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListScope {
    /// Every experiment known to the backend, whoever owns it.
    All,
    /// Only the experiments owned by the caller.
    Owned,
}

/// Display information extracted from an experiment's root configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub config_file: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub clone_date: Option<String>,
}

/// Outward facing experiment record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DecoratedExperiment {
    pub uuid: String,
    pub name: String,
    pub id: String,
    pub owned: bool,
    pub configuration: Option<ExperimentSummary>,
}

impl DecoratedExperiment {
    pub fn new(exp: ExperimentRef, owned: bool) -> Self {
        Self {
            id: exp.uuid.clone(),
            uuid: exp.uuid,
            name: exp.name,
            owned,
            configuration: None,
        }
    }
}

/// Result of reconciling the metadata store with storage contents.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Folders that had no metadata and were registered.
    pub added: Vec<String>,
    /// Metadata entries whose folder no longer exists.
    pub removed: Vec<String>,
}

/// Result of importing a zipped experiment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub message: String,
    pub zip_base_folder_name: String,
    pub dest_folder_name: String,
}
