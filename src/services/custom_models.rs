//! Inspection of user supplied model archives.
//!
//! A model archive holds exactly one top-level folder containing a
//! `model.config` XML document:
//!
//! ```xml
//! <model>
//!   <name>My Robot</name>
//!   <description>A wheeled robot</description>
//!   <sdf version="1.6">model.sdf</sdf>
//! </model>
//! ```
//!
//! Brain archives name a script with `<brain>` instead of `<sdf>`. An
//! optional `thumbnail.png` next to `model.config` is inlined as a data URI.

use base64::{Engine, engine::general_purpose::STANDARD};
use xmltree::Element;

use crate::{
    errors::{StorageError, StorageResult},
    models::{ModelDescriptor, ModelMetadata},
    utils,
};

pub const MODEL_CONFIG: &str = "model.config";
const THUMBNAIL: &str = "thumbnail.png";

/// Fields read from `model.config`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub sdf: Option<String>,
    pub brain: Option<String>,
    /// Archive path of the `model.config` file itself.
    pub config_path: String,
}

/// Which payload `extract_model_file` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    Brain,
    Robot,
    Environment,
}

/// The file `model.config` points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPayload {
    pub data: String,
    /// Full archive path for robots, path below the root folder otherwise.
    pub name: String,
    pub rel_path: String,
    pub config: ModelConfig,
}

/// An archive with a single root folder. Members are decompressed on demand.
struct ModelArchive<'a> {
    archive: &'a [u8],
    root: String,
}

impl<'a> ModelArchive<'a> {
    fn open(archive: &'a [u8]) -> StorageResult<Self> {
        let names = utils::zip_entry_names(archive)?;
        let roots = utils::zip_root_folders(names.iter().map(String::as_str));
        let mut roots = roots.into_iter();
        let (Some(root), None) = (roots.next(), roots.next()) else {
            return Err(missing_config());
        };
        if names.iter().any(|name| !name.contains('/')) {
            return Err(StorageError::Validation(
                "the model zip file must contain a single root folder and nothing else"
                    .to_string(),
            ));
        }
        Ok(Self { archive, root })
    }

    fn file(&self, relative: &str) -> StorageResult<Option<Vec<u8>>> {
        utils::read_zip_entry(self.archive, &utils::join_key([self.root.as_str(), relative]))
    }

    fn config(&self) -> StorageResult<ModelConfig> {
        let config_path = utils::join_key([self.root.as_str(), MODEL_CONFIG]);
        let content = self.file(MODEL_CONFIG)?.ok_or_else(missing_config)?;
        let root =
            Element::parse(content.as_slice()).map_err(|err| StorageError::Xml(err.to_string()))?;
        Ok(ModelConfig {
            name: child_text(&root, "name"),
            description: child_text(&root, "description"),
            sdf: child_text(&root, "sdf"),
            brain: child_text(&root, "brain"),
            config_path,
        })
    }
}

fn missing_config() -> StorageError {
    StorageError::Validation(format!(
        "The model zip file is expected to have a '{MODEL_CONFIG}' file inside the root folder \
         which contains the meta-data of the model."
    ))
}

fn child_text(parent: &Element, name: &str) -> Option<String> {
    parent
        .get_child(name)
        .and_then(|el| el.get_text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn as_text(bytes: &[u8], what: &str) -> StorageResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StorageError::Validation(format!("{what} is not valid UTF-8")))
}

/// `"My Robot"` becomes `"my_robot"`.
pub fn normalize_model_name(display_name: &str) -> String {
    display_name.to_lowercase().replace(' ', "_")
}

/// File name a model archive is stored under. Derived from the normalized
/// model name so two records never share one archive.
pub fn stored_archive_name(name: &str) -> String {
    format!("{}.zip", name.replace(['/', '\\'], "_"))
}

/// Read and validate the metadata of a model archive.
pub fn get_zip_model_metadata(
    model: &ModelDescriptor,
    archive: &[u8],
) -> StorageResult<ModelMetadata> {
    let zip = ModelArchive::open(archive)?;
    let config = zip.config()?;
    let display_name = config.name.clone().ok_or_else(|| {
        StorageError::Validation(format!(
            "name missing from the model zip file. Please add it to the {MODEL_CONFIG} \
             of the model zip file inside the root directory"
        ))
    })?;

    let thumbnail = zip
        .file(THUMBNAIL)?
        .map(|png| format!("data:image/png;base64,{}", STANDARD.encode(png)));
    let script = match &config.brain {
        Some(brain) => {
            let data = zip.file(brain)?.ok_or_else(|| {
                StorageError::Validation(format!(
                    "brain script `{brain}` is missing from the archive"
                ))
            })?;
            Some(as_text(&data, brain)?)
        }
        None => None,
    };
    let sdf = match (&config.brain, &config.sdf) {
        (None, Some(sdf)) => Some(utils::join_key([zip.root.as_str(), sdf.as_str()])),
        _ => None,
    };

    Ok(ModelMetadata {
        name: normalize_model_name(&display_name),
        display_name,
        owner_id: model.owner_id.clone(),
        model_type: model.model_type,
        file_name: utils::basename(&model.path).to_string(),
        is_shared: model.is_shared,
        is_custom: true,
        description: config.description.clone(),
        thumbnail,
        path: model.path.clone(),
        script,
        sdf,
        config_path: config.config_path,
    })
}

/// Text of `file_name` inside the archive's root folder.
pub fn extract_file_from_zip(archive: &[u8], file_name: &str) -> StorageResult<String> {
    let zip = ModelArchive::open(archive)?;
    let data = zip.file(file_name)?.ok_or_else(|| {
        StorageError::Validation(format!(
            "The model zip file should have a file called {file_name} inside the root folder"
        ))
    })?;
    as_text(&data, file_name)
}

/// The brain script or geometry file named by `model.config`.
pub fn extract_model_file(archive: &[u8], kind: PayloadKind) -> StorageResult<ModelPayload> {
    let zip = ModelArchive::open(archive)?;
    let config = zip.config()?;
    let target = match kind {
        PayloadKind::Brain => config.brain.as_deref(),
        PayloadKind::Robot | PayloadKind::Environment => config.sdf.as_deref(),
    };
    let problem = || {
        StorageError::Validation(format!(
            "There is a problem with the {} zip file. Make sure that the file (py or sdf) the \
             {MODEL_CONFIG} points to is in the zip.",
            config.name.as_deref().unwrap_or("model")
        ))
    };
    let relative = target.ok_or_else(problem)?;
    let rel_path = utils::join_key([zip.root.as_str(), relative]);
    let data = zip.file(relative)?.ok_or_else(problem)?;

    Ok(ModelPayload {
        data: as_text(&data, &rel_path)?,
        name: match kind {
            PayloadKind::Robot => rel_path.clone(),
            _ => utils::join_key([relative]),
        },
        rel_path,
        config: config.clone(),
    })
}

/// Archive members whose name ends in `ext`, case-insensitively.
pub fn files_with_extension(archive: &[u8], ext: &str) -> StorageResult<Vec<String>> {
    let ext = ext.to_lowercase();
    Ok(zip_entries(archive)?
        .into_iter()
        .filter(|name| name.to_lowercase().ends_with(&ext))
        .collect())
}

/// Names of every file member, in archive order.
pub fn zip_entries(archive: &[u8]) -> StorageResult<Vec<String>> {
    utils::zip_entry_names(archive)
}
