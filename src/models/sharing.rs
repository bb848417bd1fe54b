//! Visibility of experiments and models.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::errors::{StorageError, StorageResult};

/// Sharing flag stored alongside every experiment and model.
///
/// `Private` is the canonical default for both kinds of entity, including
/// records that were written without any sharing information.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SharingMode {
    #[default]
    Private,
    Shared,
    Public,
}

impl SharingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "Private",
            Self::Shared => "Shared",
            Self::Public => "Public",
        }
    }
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharingMode {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Private" => Ok(Self::Private),
            "Shared" => Ok(Self::Shared),
            "Public" => Ok(Self::Public),
            other => Err(StorageError::Validation(format!(
                "unknown sharing mode `{other}`, expected Private, Shared or Public"
            ))),
        }
    }
}

/// Target of a "remove shared user" request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SharedUser {
    All,
    User(String),
}

impl SharedUser {
    /// `"all"` clears the list, anything else names one user.
    pub fn parse(value: &str) -> Self {
        if value == "all" {
            Self::All
        } else {
            Self::User(value.to_string())
        }
    }
}

/// Ownership and sharing state of one entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessRecord {
    /// `None` for template and unowned entities.
    pub owner_id: Option<String>,
    pub sharing_mode: SharingMode,
    pub shared_users: BTreeSet<String>,
}

impl AccessRecord {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Owners always pass. Others pass iff the entity is public, or shared
    /// with them explicitly.
    pub fn allows(&self, user_id: &str) -> bool {
        if self.is_owner(user_id) {
            return true;
        }
        match self.sharing_mode {
            SharingMode::Public => true,
            SharingMode::Shared => self.shared_users.contains(user_id),
            SharingMode::Private => false,
        }
    }

    pub fn ensure_access(&self, entity: &str, user_id: &str) -> StorageResult<()> {
        if self.allows(user_id) {
            Ok(())
        } else {
            Err(StorageError::forbidden(entity))
        }
    }

    pub fn ensure_owner(&self, entity: &str, user_id: &str) -> StorageResult<()> {
        if self.is_owner(user_id) {
            Ok(())
        } else {
            Err(StorageError::Authorization(format!(
                "only the owner of `{entity}` may change its sharing settings"
            )))
        }
    }

    /// True for non-owners who can see the entity through sharing.
    pub fn is_shared_with(&self, user_id: &str) -> bool {
        !self.is_owner(user_id) && self.allows(user_id)
    }
}
