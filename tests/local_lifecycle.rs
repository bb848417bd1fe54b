mod common;

use assert_matches::assert_matches;
use experiment_store::{
    errors::StorageError,
    handlers::{ListOptions, RequestHandler, TrustedIdentity},
    models::SharingMode,
    services::{LocalStorage, TemplateLibrary},
};
use std::sync::Arc;

async fn handler(root: &std::path::Path) -> RequestHandler {
    let templates = root.join("templates");
    let models = root.join("models");
    common::husky_template(&templates, &models);
    let storage = LocalStorage::open(root.join("storage"), None, None).await.unwrap();
    RequestHandler::new(Arc::new(storage), Arc::new(TrustedIdentity), Arc::new(TrustedIdentity))
        .with_templates(TemplateLibrary::new(templates, models))
}

#[tokio::test]
async fn clone_share_export_and_import() {
    let root = tempfile::tempdir().unwrap();
    let handler = handler(root.path()).await;

    let id = handler
        .clone_experiment("alice", "husky_braitenberg", Some("My Husky"))
        .await
        .unwrap();
    assert_eq!(id, "husky_braitenberg_0");

    let decorated = ListOptions {
        filter: None,
        decorate: true,
    };
    let listed = handler.list_experiments("alice", &decorated).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].owned);
    let summary = listed[0].configuration.as_ref().unwrap();
    assert_eq!(summary.name.as_deref(), Some("My Husky"));
    assert!(summary.clone_date.is_some());

    assert!(handler.list_experiments("bob", &decorated).await.unwrap().is_empty());
    handler.add_experiment_shared_user("alice", &id, "bob").await.unwrap();
    handler
        .update_experiment_sharing_mode("alice", &id, SharingMode::Shared)
        .await
        .unwrap();
    let seen_by_bob = handler.list_experiments("bob", &ListOptions::default()).await.unwrap();
    assert_eq!(seen_by_bob.len(), 1);
    assert!(!seen_by_bob[0].owned);
    assert_matches!(
        handler.delete_experiment("bob", &id).await,
        Err(StorageError::Authorization(_))
    );

    let archive = handler.zip_experiment("bob", &id).await.unwrap();
    assert_eq!(
        common::zip_names(&archive),
        vec![
            "husky_braitenberg_0/brain/init.py",
            "husky_braitenberg_0/resources/tf.py",
            "husky_braitenberg_0/simulation_config.json",
            "husky_braitenberg_0/world.sdf",
        ]
    );

    let imported = handler.register_zipped_experiment("bob", archive).await.unwrap();
    assert_eq!(imported.zip_base_folder_name, "husky_braitenberg_0");
    assert_eq!(imported.dest_folder_name, "husky_braitenberg_0_0");
    let bobs = handler.list_experiments("bob", &ListOptions::default()).await.unwrap();
    let owned: Vec<&str> = bobs.iter().filter(|e| e.owned).map(|e| e.name.as_str()).collect();
    assert_eq!(owned, vec!["husky_braitenberg_0_0"]);
}

#[tokio::test]
async fn scan_picks_up_folders_written_out_of_band() {
    let root = tempfile::tempdir().unwrap();
    let handler = handler(root.path()).await;
    handler.create_experiment("alice", "registered").await.unwrap();
    common::write(&root.path().join("storage"), "dropped_in/simulation_config.json", "{}");
    std::fs::remove_dir_all(root.path().join("storage/registered")).unwrap();

    let report = handler.scan_storage("alice").await.unwrap();
    assert_eq!(report.added, vec!["dropped_in".to_string()]);
    assert_eq!(report.removed, vec!["registered".to_string()]);
}

#[tokio::test]
async fn failed_clone_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let handler = handler(root.path()).await;
    common::write(
        &root.path().join("templates"),
        "broken/simulation_config.json",
        r#"{"SimulationName": "Broken", "GazeboWorldFile": "missing/world.sdf"}"#,
    );

    assert_matches!(
        handler.clone_experiment("alice", "broken", None).await,
        Err(StorageError::NotFound(_))
    );
    assert!(handler.list_experiments("alice", &ListOptions::default()).await.unwrap().is_empty());
    assert!(!root.path().join("storage/broken_0").exists());
}
