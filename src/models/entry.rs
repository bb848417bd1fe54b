//! Listing records and file payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Folder,
}

/// One row of a folder listing. Never persisted, always derived on read.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Relative path for the local backend, object key for the remote one.
    pub uuid: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub modified_on: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn is_folder(&self) -> bool {
        self.entry_type == EntryType::Folder
    }
}

/// Addressing mode for file level operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileLocator<'a> {
    /// Stable id as returned in [`FileEntry::uuid`].
    Id(&'a str),
    /// Name relative to an experiment, resolved through a listing.
    Name { experiment: &'a str, name: &'a str },
}

/// Whether `create_or_update` replaces or extends a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// Result of reading a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub uuid: String,
    pub content_type: String,
    pub content_disposition: String,
    pub body: Bytes,
}

/// Handle on a file or folder that was just written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EntryRef {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}
