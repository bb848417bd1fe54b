//! Robot, brain and environment packages.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::sharing::SharingMode;
use crate::errors::StorageError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Robot,
    Brain,
    Environment,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [Self::Robot, Self::Brain, Self::Environment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Robot => "robot",
            Self::Brain => "brain",
            Self::Environment => "environment",
        }
    }

    /// Folder holding models of this type under the user-data root.
    pub fn folder(&self) -> &'static str {
        match self {
            Self::Robot => "robots",
            Self::Brain => "brains",
            Self::Environment => "environments",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = StorageError;

    /// Accepts both the singular type and its folder name.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "robot" | "robots" => Ok(Self::Robot),
            "brain" | "brains" => Ok(Self::Brain),
            "environment" | "environments" => Ok(Self::Environment),
            other => Err(StorageError::Validation(format!(
                "unknown model type `{other}`"
            ))),
        }
    }
}

/// Metadata row for a stored model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub owner_id: Option<String>,
    /// Archive file name, relative to the type folder.
    pub file_name: String,
    /// Storage relative path of the archive.
    pub path: String,
    pub is_custom: bool,
    pub sharing_mode: SharingMode,
    pub shared_users: Vec<String>,
}

/// What a caller knows about an archive before it is inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub owner_id: Option<String>,
    pub model_type: ModelType,
    pub path: String,
    pub is_shared: bool,
    pub is_custom: bool,
}

impl From<&ModelRecord> for ModelDescriptor {
    fn from(record: &ModelRecord) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            model_type: record.model_type,
            path: record.path.clone(),
            is_shared: record.sharing_mode != SharingMode::Private,
            is_custom: record.is_custom,
        }
    }
}

/// Metadata extracted from a model archive, ready to be registered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    /// Lower-cased, underscore separated form of `display_name`.
    pub name: String,
    pub display_name: String,
    pub owner_id: Option<String>,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub file_name: String,
    pub is_shared: bool,
    pub is_custom: bool,
    pub description: Option<String>,
    /// `data:image/png;base64,…` when the archive ships a thumbnail.
    pub thumbnail: Option<String>,
    pub path: String,
    /// Brain script contents.
    pub script: Option<String>,
    /// Geometry file, relative to the archive root.
    pub sdf: Option<String>,
    pub config_path: String,
}
