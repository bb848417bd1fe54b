#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use experiment_store::{
    errors::{StorageError, StorageResult},
    services::remote::client::{BucketClient, BucketEntry},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::{Arc, Mutex},
};

/// Bucket kept in a map; keys ending in `/` are folder markers.
#[derive(Default)]
pub struct MemoryBucket {
    pub objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBucket {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BucketClient for MemoryBucket {
    async fn list(&self, _token: &str, prefix: &str) -> StorageResult<Vec<BucketEntry>> {
        let objects = self.objects.lock().unwrap();
        let mut prefixes = BTreeSet::new();
        let mut entries = Vec::new();
        for (key, body) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, tail)) if !(dir.is_empty() && tail.is_empty()) => {
                    prefixes.insert(format!("{prefix}{dir}/"));
                }
                _ => entries.push(BucketEntry::Object {
                    key: key.clone(),
                    size: body.len() as u64,
                    content_type: None,
                    last_modified: None,
                }),
            }
        }
        entries.extend(prefixes.into_iter().map(BucketEntry::Prefix));
        Ok(entries)
    }

    async fn get(&self, _token: &str, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        _token: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> StorageResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, _token: &str, key: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn copy(&self, _token: &str, key: &str, new_key: &str) -> StorageResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let body = objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        objects.insert(new_key.to_string(), body);
        Ok(())
    }
}

/// [`MemoryBucket`] whose uploads fail for keys ending in `suffix`.
pub struct FailingUploads {
    pub inner: Arc<MemoryBucket>,
    pub suffix: &'static str,
}

#[async_trait]
impl BucketClient for FailingUploads {
    async fn list(&self, token: &str, prefix: &str) -> StorageResult<Vec<BucketEntry>> {
        self.inner.list(token, prefix).await
    }

    async fn get(&self, token: &str, key: &str) -> StorageResult<Bytes> {
        self.inner.get(token, key).await
    }

    async fn put(
        &self,
        token: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        if key.ends_with(self.suffix) {
            return Err(StorageError::Status {
                status: 500,
                message: format!("upload of {key} refused"),
            });
        }
        self.inner.put(token, key, body, content_type).await
    }

    async fn delete(&self, token: &str, key: &str) -> StorageResult<()> {
        self.inner.delete(token, key).await
    }

    async fn copy(&self, token: &str, key: &str, new_key: &str) -> StorageResult<()> {
        self.inner.copy(token, key, new_key).await
    }
}

pub fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

/// A JSON template `husky_braitenberg` referencing one file from the model library.
pub fn husky_template(templates: &Path, models: &Path) {
    write(
        templates,
        "husky_braitenberg/simulation_config.json",
        r#"{
            "SimulationName": "Husky",
            "SimulationDescription": "Husky with a Braitenberg brain",
            "EngineConfigs": [
                {"EngineType": "nest", "NestInitFileName": "brain/init.py"},
                {"EngineType": "gazebo", "GazeboWorldFile": "husky_world/world.sdf"}
            ]
        }"#,
    );
    write(templates, "husky_braitenberg/brain/init.py", "import nest");
    write(templates, "husky_braitenberg/resources/tf.py", "def tf(): pass");
    write(models, "husky_world/world.sdf", "<sdf/>");
}

/// Sorted member names of a zip.
pub fn zip_names(archive: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = experiment_store::utils::read_zip_entries(archive)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    names
}
