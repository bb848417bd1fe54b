mod common;

use assert_matches::assert_matches;
use bytes::Bytes;
use common::{FailingUploads, MemoryBucket};
use experiment_store::{
    errors::StorageError,
    handlers::{BackendAuthenticator, ListOptions, RequestHandler, TrustedIdentity},
    models::SharingMode,
    services::{
        RemoteStorage, TemplateLibrary,
        remote::{BucketClient, REGISTRY_FILE},
    },
};
use std::sync::Arc;

fn handler(bucket: Arc<dyn BucketClient>, root: &std::path::Path) -> RequestHandler {
    let templates = root.join("templates");
    let models = root.join("models");
    common::husky_template(&templates, &models);
    RequestHandler::new(
        Arc::new(RemoteStorage::new(bucket)),
        Arc::new(BackendAuthenticator),
        Arc::new(TrustedIdentity),
    )
    .with_templates(TemplateLibrary::new(templates, models))
}

#[tokio::test]
async fn templates_clone_into_the_bucket() {
    let root = tempfile::tempdir().unwrap();
    let bucket = Arc::new(MemoryBucket::default());
    let handler = handler(bucket.clone(), root.path());

    let id = handler
        .clone_experiment("alice", "husky_braitenberg", None)
        .await
        .unwrap();
    assert_eq!(id, "husky_braitenberg_0");

    let keys = bucket.keys();
    for expected in [
        "husky_braitenberg_0/brain/init.py",
        "husky_braitenberg_0/resources/tf.py",
        "husky_braitenberg_0/simulation_config.json",
        "husky_braitenberg_0/world.sdf",
        "husky_braitenberg_0/resources/textures/",
    ] {
        assert!(keys.iter().any(|k| k == expected), "missing {expected} in {keys:?}");
    }
    assert!(keys.iter().any(|k| k == REGISTRY_FILE));

    let listed = handler.list_experiments("alice", &ListOptions::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].owned);

    handler.delete_experiment("alice", &id).await.unwrap();
    let keys = bucket.keys();
    assert!(
        !keys.iter().any(|k| k.starts_with("husky_braitenberg_0")),
        "left behind: {keys:?}"
    );
}

#[tokio::test]
async fn copies_and_sharing_go_through_the_registry() {
    let root = tempfile::tempdir().unwrap();
    let bucket = Arc::new(MemoryBucket::default());
    let handler = handler(bucket.clone(), root.path());

    handler.create_experiment("alice", "exp").await.unwrap();
    handler
        .create_or_update(
            "alice",
            "exp",
            "simulation_config.json",
            Bytes::from_static(br#"{"SimulationName":"exp"}"#),
            "application/json",
            false,
        )
        .await
        .unwrap();
    assert_matches!(
        handler.create_experiment("bob", "exp").await,
        Err(StorageError::Conflict(_))
    );

    let copied = handler.copy_experiment("alice", "exp").await.unwrap();
    assert_eq!(copied.cloned_exp, "exp_0");
    assert_eq!(copied.original_exp, "exp");

    assert_matches!(
        handler.list_files("bob", "exp_0").await,
        Err(StorageError::Authorization(_))
    );
    handler
        .update_experiment_sharing_mode("alice", "exp_0", SharingMode::Public)
        .await
        .unwrap();
    let files = handler.list_files("bob", "exp_0").await.unwrap();
    assert!(files.iter().any(|f| f.name == "simulation_config.json"));

    let shared = handler.list_experiments_shared_with("bob").await.unwrap();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].name, "exp_0");
}

#[tokio::test]
async fn failed_upload_rolls_the_clone_back() {
    let root = tempfile::tempdir().unwrap();
    let bucket = Arc::new(MemoryBucket::default());
    let failing = Arc::new(FailingUploads {
        inner: bucket.clone(),
        suffix: "world.sdf",
    });
    let handler = handler(failing, root.path());

    assert_matches!(
        handler.clone_experiment("alice", "husky_braitenberg", None).await,
        Err(StorageError::Status { status: 500, .. })
    );

    let keys = bucket.keys();
    assert!(
        !keys.iter().any(|k| k.starts_with("husky_braitenberg_0")),
        "partial clone left behind: {keys:?}"
    );
    assert!(handler.list_experiments("alice", &ListOptions::default()).await.unwrap().is_empty());
}
