//! Storage backends and the services built on top of them.

pub mod archive;
pub mod cloner;
pub mod custom_models;
pub mod local;
pub mod remote;
pub mod storage;

pub use archive::{ExperimentImporter, ExperimentZipper};
pub use cloner::{
    CloneSource, ExperimentCloner, ExperimentConfig, StoredExperiment, TemplateLibrary,
};
pub use local::{LocalStorage, MetadataStore};
pub use remote::{BucketClient, HttpBucketClient, RemoteStorage};
pub use storage::Storage;
