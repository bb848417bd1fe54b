//! Core data models for the experiment storage service.
//!
//! These entities describe experiments, models and their sharing state. They
//! serialize as JSON via `serde` using the field names the HTTP façade
//! exposes.

pub mod entry;
pub mod experiment;
pub mod identity;
pub mod model;
pub mod sharing;

pub use entry::{EntryRef, EntryType, FileContent, FileEntry, FileLocator, WriteMode};
pub use experiment::{
    CloneResult, DecoratedExperiment, Experiment, ExperimentRef, ExperimentSummary, ImportResult,
    ListScope, ScanReport,
};
pub use identity::{Identity, UserContext};
pub use model::{ModelDescriptor, ModelMetadata, ModelRecord, ModelType};
pub use sharing::{AccessRecord, SharedUser, SharingMode};
