//! Cloning template experiments into user storage.
//!
//! A clone runs through a fixed sequence of phases:
//!
//! - **AllocateName**: derive a unique destination id from the template name.
//! - **CopyTemplate**: create the destination experiment for the caller.
//! - **FlattenReferences**: load the root configuration, stage every file it
//!   references into a temporary directory and rewrite each reference to the
//!   staged path.
//! - **UploadFlattened**: upload the staged files concurrently, then the
//!   rewritten configuration.
//!
//! Any failure after the destination exists rolls it back with
//! `delete_experiment` before the original error is returned.

pub mod config;
pub mod source;

use bytes::Bytes;
use futures::future::try_join_all;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::Path,
    sync::Arc,
};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};

pub use config::ExperimentConfig;
pub use source::{CloneSource, StoredExperiment, TemplateLibrary};

use self::config::{
    FLAT_BIBI_FILE, FLAT_EXC_FILE, JSON_CONFIG_FILE, ReferenceKind, root_config_name,
};
use super::storage::Storage;
use crate::{
    errors::{StorageError, StorageResult},
    models::{UserContext, WriteMode},
    utils,
};

/// Subtrees copied verbatim whether or not the configuration names them.
const VERBATIM_FOLDERS: [&str; 2] = ["resources/", "assets/"];
/// Every clone gets `resources/textures`, even when empty.
const RESOURCES_FOLDER: &str = "resources";
const TEXTURES_FOLDER: &str = "textures";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClonePhase {
    AllocateName,
    CopyTemplate,
    FlattenReferences,
    UploadFlattened,
    Done,
    Rollback,
}

impl fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::AllocateName => "allocate-name",
            Self::CopyTemplate => "copy-template",
            Self::FlattenReferences => "flatten-references",
            Self::UploadFlattened => "upload-flattened",
            Self::Done => "done",
            Self::Rollback => "rollback",
        };
        f.write_str(label)
    }
}

/// A template reference: a folder, optionally naming its root configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateRef {
    pub folder: String,
    pub config_file: Option<String>,
}

impl TemplateRef {
    /// Accepts `folder` or `folder/file.exc` (or `folder/simulation_config.json`).
    pub fn parse(value: &str) -> StorageResult<Self> {
        let clean = utils::join_key([value]);
        let (folder, file) = match clean.split_once('/') {
            Some((folder, file)) if is_config_file(file) => (folder, Some(file.to_string())),
            _ => (clean.as_str(), None),
        };
        if folder.is_empty() {
            return Err(StorageError::Validation(
                "template reference must name a folder".to_string(),
            ));
        }
        utils::sanitize_relative_path(folder)?;
        Ok(Self {
            folder: folder.to_string(),
            config_file: file,
        })
    }
}

fn is_config_file(name: &str) -> bool {
    !name.contains('/') && root_config_name([name]).is_some()
}

/// Which tree a staged file was read from, for de-duplication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Origin {
    Experiment,
    Models,
}

/// Files of one clone laid out in a temporary directory.
struct Staging {
    dir: TempDir,
    by_source: HashMap<(Origin, String), String>,
    taken: BTreeSet<String>,
}

impl Staging {
    fn new() -> StorageResult<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            by_source: HashMap::new(),
            taken: BTreeSet::new(),
        })
    }

    /// Stage `data` under `preferred`, or under a disambiguated name when
    /// another source already uses it. The same source staged twice keeps
    /// its first destination.
    async fn stage(
        &mut self,
        origin: Origin,
        source_path: &str,
        preferred: &str,
        data: Bytes,
    ) -> StorageResult<String> {
        let key = (origin, source_path.to_string());
        if let Some(existing) = self.by_source.get(&key) {
            return Ok(existing.clone());
        }
        let destination = utils::unique_file_name(preferred, &self.taken);
        let path = self.dir.path().join(utils::sanitize_relative_path(&destination)?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;

        self.taken.insert(destination.clone());
        self.by_source.insert(key, destination.clone());
        Ok(destination)
    }

    fn destinations(&self) -> &BTreeSet<String> {
        &self.taken
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Clones templates into storage for a caller.
#[derive(Clone)]
pub struct ExperimentCloner {
    storage: Arc<dyn Storage>,
}

impl ExperimentCloner {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Clone `template` from `source` and return the new experiment id.
    ///
    /// `display_name` is stamped into the configuration, defaulting to the
    /// new id.
    pub async fn clone_experiment(
        &self,
        user: &UserContext,
        source: &dyn CloneSource,
        template: &str,
        display_name: Option<&str>,
    ) -> StorageResult<String> {
        let template = TemplateRef::parse(template)?;

        log_phase(ClonePhase::AllocateName, &template.folder);
        let base = utils::basename(&template.folder);
        let destination = self.storage.create_unique_experiment_id(user, base).await?;

        log_phase(ClonePhase::CopyTemplate, &destination);
        self.storage.create_experiment(user, &destination).await?;

        let outcome = self
            .flatten_and_upload(user, source, &template, &destination, display_name)
            .await;
        match outcome {
            Ok(count) => {
                log_phase(ClonePhase::Done, &destination);
                info!(
                    template = %template.folder,
                    source = %source.describe(),
                    experiment = %destination,
                    files = count,
                    "cloned experiment"
                );
                Ok(destination)
            }
            Err(err) => {
                log_phase(ClonePhase::Rollback, &destination);
                warn!(experiment = %destination, error = %err, "clone failed, rolling back");
                if let Err(rollback) = self.storage.delete_experiment(user, &destination).await {
                    warn!(experiment = %destination, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn flatten_and_upload(
        &self,
        user: &UserContext,
        source: &dyn CloneSource,
        template: &TemplateRef,
        destination: &str,
        display_name: Option<&str>,
    ) -> StorageResult<usize> {
        log_phase(ClonePhase::FlattenReferences, destination);
        let experiment = template.folder.as_str();
        let files = source.list_files(experiment).await?;

        let config_file = match &template.config_file {
            Some(file) => file.clone(),
            None => root_config_name(files.iter().map(String::as_str).filter(|f| !f.contains('/')))
                .map(str::to_string)
                .ok_or_else(|| {
                    StorageError::Validation(format!(
                        "template `{experiment}` has no experiment configuration"
                    ))
                })?,
        };
        let root = source.read_file(experiment, &config_file).await?;
        let mut config = ExperimentConfig::parse(&config_file, &root)?;

        let mut skip = BTreeSet::from([config_file.clone()]);
        if let Some(bibi) = config.bibi_reference() {
            let bibi = utils::join_key([bibi.as_str()]);
            config.attach_bibi(&source.read_file(experiment, &bibi).await?)?;
            config.flatten_bibi_reference();
            skip.insert(bibi);
        }

        let mut staging = Staging::new()?;
        for reference in config.references() {
            let flattened =
                stage_reference(source, experiment, &reference.value, &reference.kind, &mut staging)
                    .await?;
            debug!(from = %reference.value, to = %flattened, "rewrote reference");
            config.rewrite(&reference.slot, &flattened)?;
        }

        for file in files
            .iter()
            .filter(|f| VERBATIM_FOLDERS.iter().any(|folder| f.starts_with(folder)))
            .filter(|f| !skip.contains(*f))
        {
            let data = source.read_file(experiment, file).await?;
            staging.stage(Origin::Experiment, file, file, data).await?;
        }

        config.set_name(display_name.unwrap_or(destination));
        config.set_clone_date(&utils::current_time_and_date());

        log_phase(ClonePhase::UploadFlattened, destination);
        self.upload(user, destination, &staging).await?;

        let root_name = if config.is_legacy() {
            if let Some(bibi) = config.bibi_bytes()? {
                self.put(user, destination, FLAT_BIBI_FILE, Bytes::from(bibi)).await?;
            }
            FLAT_EXC_FILE
        } else {
            JSON_CONFIG_FILE
        };
        self.put(user, destination, root_name, Bytes::from(config.root_bytes()?))
            .await?;

        let resources = utils::join_key([destination, RESOURCES_FOLDER]);
        self.storage
            .create_folder(user, destination, RESOURCES_FOLDER)
            .await?;
        self.storage
            .create_folder(user, &resources, TEXTURES_FOLDER)
            .await?;
        Ok(staging.destinations().len() + 1)
    }

    async fn upload(
        &self,
        user: &UserContext,
        destination: &str,
        staging: &Staging,
    ) -> StorageResult<()> {
        try_join_all(staging.destinations().iter().map(|name| async move {
            let data = fs::read(staging.path().join(utils::sanitize_relative_path(name)?)).await?;
            self.put(user, destination, name, Bytes::from(data)).await
        }))
        .await?;
        Ok(())
    }

    async fn put(
        &self,
        user: &UserContext,
        destination: &str,
        name: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let content_type = utils::content_type_for(name);
        self.storage
            .create_or_update(user, destination, name, data, &content_type, WriteMode::Overwrite)
            .await?;
        Ok(())
    }
}

fn log_phase(phase: ClonePhase, subject: &str) {
    debug!(%phase, subject, "clone phase");
}

/// Stage one reference and return the value to write back into the
/// configuration.
async fn stage_reference(
    source: &dyn CloneSource,
    experiment: &str,
    value: &str,
    kind: &ReferenceKind,
    staging: &mut Staging,
) -> StorageResult<String> {
    let path = utils::join_key([value]);
    utils::sanitize_relative_path(&path)?;
    let base = utils::basename(&path).to_string();

    match kind {
        ReferenceKind::RewriteOnly => Ok(base),
        ReferenceKind::ExperimentFile => {
            let data = source.read_file(experiment, &path).await?;
            staging.stage(Origin::Experiment, &path, &path, data).await
        }
        ReferenceKind::Model => {
            let data = source.read_model_file(&path).await?;
            staging.stage(Origin::Models, &path, &base, data).await
        }
        ReferenceKind::RobotBody { robot_id } => {
            let data = source.read_model_file(&path).await?;
            let body = staging
                .stage(
                    Origin::Models,
                    &path,
                    &utils::join_key([robot_id.as_str(), base.as_str()]),
                    data,
                )
                .await?;

            let model_dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            let launch = source
                .list_model_dir(model_dir)
                .await?
                .into_iter()
                .find(|name| name.ends_with(".launch"));
            if let Some(launch) = launch {
                let launch_path = utils::join_key([model_dir, launch.as_str()]);
                let data = source.read_model_file(&launch_path).await?;
                staging
                    .stage(
                        Origin::Models,
                        &launch_path,
                        &utils::join_key([robot_id.as_str(), launch.as_str()]),
                        data,
                    )
                    .await?;
            }
            Ok(body)
        }
        ReferenceKind::Auto => match source.read_file(experiment, &path).await {
            Ok(data) => staging.stage(Origin::Experiment, &path, &path, data).await,
            Err(StorageError::NotFound(_)) => {
                let data = source.read_model_file(&path).await?;
                staging.stage(Origin::Models, &path, &base, data).await
            }
            Err(err) => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{FileLocator, ListScope},
        services::local::{LocalStorage, MetadataStore},
    };
    use assert_matches::assert_matches;

    struct Fixture {
        _root: TempDir,
        templates: std::path::PathBuf,
        models: std::path::PathBuf,
        storage: Arc<LocalStorage>,
    }

    async fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let templates = root.path().join("templates");
        let models = root.path().join("models");
        let store_dir = root.path().join("storage");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::create_dir_all(&models).unwrap();
        std::fs::create_dir_all(&store_dir).unwrap();
        let store = MetadataStore::in_memory().await.unwrap();
        let storage = Arc::new(LocalStorage::new(store, &store_dir, store_dir.join("USER_DATA")));
        Fixture {
            _root: root,
            templates,
            models,
            storage,
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    async fn read(storage: &LocalStorage, user: &UserContext, id: &str) -> String {
        let file = storage.get_file(user, FileLocator::Id(id)).await.unwrap();
        String::from_utf8(file.body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_clone_uploads_every_reference_plus_config() {
        let fx = fixture().await;
        write(
            &fx.templates,
            "husky_braitenberg/simulation_config.json",
            r#"{
                "SimulationName": "Husky",
                "Thumbnail": "husky.png",
                "EngineConfigs": [
                    {"EngineType": "nest", "NestInitFileName": "brain/init.py"},
                    {"EngineType": "gazebo", "GazeboWorldFile": "husky_world/world.sdf"}
                ]
            }"#,
        );
        write(&fx.templates, "husky_braitenberg/husky.png", "png");
        write(&fx.templates, "husky_braitenberg/brain/init.py", "print()");
        write(&fx.templates, "husky_braitenberg/assets/logo.txt", "logo");
        write(&fx.models, "husky_world/world.sdf", "<sdf/>");

        let user = UserContext::new("t", "alice");
        let cloner = ExperimentCloner::new(fx.storage.clone());
        let source = TemplateLibrary::new(&fx.templates, &fx.models);
        let id = cloner
            .clone_experiment(&user, &source, "husky_braitenberg", None)
            .await
            .unwrap();
        assert_eq!(id, "husky_braitenberg_0");

        let dest = fx.storage.base_path.join(&id);
        let files = utils::walk_files(&dest).unwrap();
        assert_eq!(
            files,
            vec![
                "assets/logo.txt".to_string(),
                "brain/init.py".to_string(),
                "husky.png".to_string(),
                "simulation_config.json".to_string(),
                "world.sdf".to_string(),
            ]
        );

        let config = read(&fx.storage, &user, &format!("{id}/simulation_config.json")).await;
        let config: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(config["SimulationName"], id);
        assert_eq!(config["EngineConfigs"][1]["GazeboWorldFile"], "world.sdf");
        assert!(config["CloneDate"].is_string());
        assert_eq!(read(&fx.storage, &user, &format!("{id}/world.sdf")).await, "<sdf/>");
        assert!(dest.join("resources/textures").is_dir());
    }

    #[tokio::test]
    async fn legacy_clone_flattens_models_and_robot_launch() {
        let fx = fixture().await;
        write(
            &fx.templates,
            "husky/ExDHusky.exc",
            r#"<ExD>
                <name>Husky</name>
                <thumbnail>husky.png</thumbnail>
                <environmentModel src="virtual_room/virtual_room.sdf"/>
                <bibiConf src="husky.bibi"/>
            </ExD>"#,
        );
        write(
            &fx.templates,
            "husky/husky.bibi",
            r#"<bibi>
                <brainModel><file>brains/braitenberg.py</file></brainModel>
                <bodyModel robotId="husky">husky_model/model.sdf</bodyModel>
                <transferFunction src="eye.py"/>
            </bibi>"#,
        );
        write(&fx.templates, "husky/husky.png", "png");
        write(&fx.templates, "husky/eye.py", "tf");
        write(&fx.models, "virtual_room/virtual_room.sdf", "room");
        write(&fx.models, "brains/braitenberg.py", "brain");
        write(&fx.models, "husky_model/model.sdf", "body");
        write(&fx.models, "husky_model/husky.launch", "launch");

        let user = UserContext::new("t", "alice");
        let cloner = ExperimentCloner::new(fx.storage.clone());
        let source = TemplateLibrary::new(&fx.templates, &fx.models);
        let id = cloner
            .clone_experiment(&user, &source, "husky/ExDHusky.exc", Some("My Husky"))
            .await
            .unwrap();

        let files = utils::walk_files(&fx.storage.base_path.join(&id)).unwrap();
        assert_eq!(
            files,
            vec![
                "bibi_configuration.bibi".to_string(),
                "braitenberg.py".to_string(),
                "experiment_configuration.exc".to_string(),
                "eye.py".to_string(),
                "husky.png".to_string(),
                "husky/husky.launch".to_string(),
                "husky/model.sdf".to_string(),
                "virtual_room.sdf".to_string(),
            ]
        );

        let exc = read(&fx.storage, &user, &format!("{id}/experiment_configuration.exc")).await;
        assert!(exc.contains("<name>My Husky</name>"));
        assert!(exc.contains(r#"src="bibi_configuration.bibi""#));
        assert!(exc.contains(r#"src="virtual_room.sdf""#));
        let bibi = read(&fx.storage, &user, &format!("{id}/bibi_configuration.bibi")).await;
        assert!(bibi.contains("husky/model.sdf"));
        assert!(bibi.contains("<file>braitenberg.py</file>"));
    }

    #[tokio::test]
    async fn missing_reference_rolls_back_destination() {
        let fx = fixture().await;
        write(
            &fx.templates,
            "broken/simulation_config.json",
            r#"{"SimulationName": "Broken", "BrainFileName": "missing.py"}"#,
        );

        let user = UserContext::new("t", "alice");
        let cloner = ExperimentCloner::new(fx.storage.clone());
        let source = TemplateLibrary::new(&fx.templates, &fx.models);
        let err = cloner
            .clone_experiment(&user, &source, "broken", None)
            .await
            .unwrap_err();
        assert_matches!(err, StorageError::NotFound(_));

        let listed = fx.storage.list_experiments(&user, ListScope::All).await.unwrap();
        assert!(listed.is_empty());
        assert!(!fx.storage.base_path.join("broken_0").exists());
    }

    #[tokio::test]
    async fn stored_experiment_clones_with_unique_names() {
        let fx = fixture().await;
        let user = UserContext::new("t", "alice");
        fx.storage.create_experiment(&user, "mine").await.unwrap();
        fx.storage
            .create_or_update(
                &user,
                "mine",
                "simulation_config.json",
                Bytes::from_static(
                    br#"{"SimulationName":"Mine","ResourcesFile":"resources/a.txt"}"#,
                ),
                "application/json",
                WriteMode::Overwrite,
            )
            .await
            .unwrap();
        fx.storage
            .create_or_update(
                &user,
                "mine",
                "resources/a.txt",
                Bytes::from_static(b"a"),
                "text/plain",
                WriteMode::Overwrite,
            )
            .await
            .unwrap();

        let storage: Arc<dyn Storage> = fx.storage.clone();
        let cloner = ExperimentCloner::new(storage.clone());
        let source = StoredExperiment::new(storage, user.clone(), None);
        let first = cloner.clone_experiment(&user, &source, "mine", None).await.unwrap();
        let second = cloner.clone_experiment(&user, &source, "mine", None).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("mine_0", "mine_1"));

        let files = utils::walk_files(&fx.storage.base_path.join(&second)).unwrap();
        assert_eq!(
            files,
            vec!["resources/a.txt".to_string(), "simulation_config.json".to_string()]
        );
    }

    #[test]
    fn template_refs_accept_folder_or_config_file() {
        assert_eq!(
            TemplateRef::parse("husky").unwrap(),
            TemplateRef { folder: "husky".into(), config_file: None }
        );
        assert_eq!(
            TemplateRef::parse("husky/ExDHusky.exc").unwrap().config_file.as_deref(),
            Some("ExDHusky.exc")
        );
        assert!(TemplateRef::parse("../etc").is_err());
        assert!(TemplateRef::parse("").is_err());
    }
}
