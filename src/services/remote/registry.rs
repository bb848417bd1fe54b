//! The bucket level experiment registry, `nrp-experiments.json`.

use serde::{Deserialize, Serialize};

use crate::models::{AccessRecord, ModelRecord, ModelType, SharingMode};

pub const REGISTRY_FILE: &str = "nrp-experiments.json";
const FOLDER_TYPE: &str = "folder";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registry {
    #[serde(default)]
    pub experiments: Vec<RegistryEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
}

/// An experiment prefix. Ownership fields are absent in registries written
/// by older tooling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing_mode: Option<SharingMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_date: Option<String>,
}

impl RegistryEntry {
    pub fn folder(path: &str, owner: &str) -> Self {
        Self {
            entry_type: FOLDER_TYPE.to_string(),
            path: path.to_string(),
            owner: Some(owner.to_string()),
            sharing_mode: None,
            shared_users: Vec::new(),
            clone_date: None,
        }
    }

    /// Entries without an owner are left to the bucket's own access control.
    pub fn access(&self) -> AccessRecord {
        access_record(&self.owner, self.sharing_mode, &self.shared_users)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ModelEntry {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub name: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing_mode: Option<SharingMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_users: Vec<String>,
    #[serde(default = "default_custom")]
    pub is_custom: bool,
}

fn default_custom() -> bool {
    true
}

impl ModelEntry {
    pub fn access(&self) -> AccessRecord {
        access_record(&self.owner, self.sharing_mode, &self.shared_users)
    }

    /// Object key of the model archive.
    pub fn key(&self) -> String {
        model_key(self.model_type, &self.file_name)
    }

    pub fn to_record(&self) -> ModelRecord {
        ModelRecord {
            name: self.name.clone(),
            model_type: self.model_type,
            owner_id: self.owner.clone(),
            file_name: self.file_name.clone(),
            path: self.key(),
            is_custom: self.is_custom,
            sharing_mode: self.sharing_mode.unwrap_or_default(),
            shared_users: self.shared_users.clone(),
        }
    }
}

pub fn model_key(model_type: ModelType, file_name: &str) -> String {
    format!("models/{}/{file_name}", model_type.folder())
}

fn access_record(
    owner: &Option<String>,
    mode: Option<SharingMode>,
    shared_users: &[String],
) -> AccessRecord {
    AccessRecord {
        owner_id: owner.clone(),
        sharing_mode: match owner {
            None => SharingMode::Public,
            Some(_) => mode.unwrap_or_default(),
        },
        shared_users: shared_users.iter().cloned().collect(),
    }
}

impl Registry {
    pub fn experiment(&self, path: &str) -> Option<&RegistryEntry> {
        self.experiments.iter().find(|entry| entry.path == path)
    }

    pub fn experiment_mut(&mut self, path: &str) -> Option<&mut RegistryEntry> {
        self.experiments.iter_mut().find(|entry| entry.path == path)
    }

    /// Remove `path`, returning whether it was registered.
    pub fn remove_experiment(&mut self, path: &str) -> bool {
        let before = self.experiments.len();
        self.experiments.retain(|entry| entry.path != path);
        self.experiments.len() != before
    }

    pub fn model(&self, model_type: ModelType, name: &str) -> Option<&ModelEntry> {
        self.models
            .iter()
            .find(|m| m.model_type == model_type && m.name == name)
    }

    pub fn model_mut(&mut self, model_type: ModelType, name: &str) -> Option<&mut ModelEntry> {
        self.models
            .iter_mut()
            .find(|m| m.model_type == model_type && m.name == name)
    }

    pub fn remove_model(&mut self, model_type: ModelType, name: &str) -> bool {
        let before = self.models.len();
        self.models
            .retain(|m| !(m.model_type == model_type && m.name == name));
        self.models.len() != before
    }
}
