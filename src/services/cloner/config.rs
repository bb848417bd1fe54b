//! Experiment configuration documents.
//!
//! An experiment is described either by a `simulation_config.json` file or by
//! a legacy pair of XML documents: an `.exc` experiment file pointing at a
//! `.bibi` file. Both are loaded into [`ExperimentConfig`] and expose the same
//! operations: enumerate file references, rewrite them, stamp name and clone
//! date, serialize back.

use serde_json::Value;
use std::borrow::Cow;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::{
    errors::{StorageError, StorageResult},
    models::ExperimentSummary,
};

pub const JSON_CONFIG_FILE: &str = "simulation_config.json";
pub const EXC_SUFFIX: &str = ".exc";
/// File names the flattened legacy documents are written under.
pub const FLAT_EXC_FILE: &str = "experiment_configuration.exc";
pub const FLAT_BIBI_FILE: &str = "bibi_configuration.bibi";

const DEFAULT_ROBOT_ID: &str = "robot";

/// Pick the root configuration among the top-level files of an experiment.
///
/// `simulation_config.json` wins over any `.exc` file.
pub fn root_config_name<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut exc = None;
    for name in names {
        if name == JSON_CONFIG_FILE {
            return Some(name);
        }
        if exc.is_none() && name.ends_with(EXC_SUFFIX) {
            exc = Some(name);
        }
    }
    exc
}

/// Which document of a legacy pair a reference lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmlDocument {
    Exc,
    Bibi,
}

/// Where in a document a reference value is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// JSON pointer to a string value.
    Json(String),
    /// Element reached by child indices from the document root.
    XmlAttribute {
        document: XmlDocument,
        path: Vec<usize>,
        attribute: &'static str,
    },
    XmlText {
        document: XmlDocument,
        path: Vec<usize>,
    },
}

/// How a referenced file is located and where its flattened copy goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Relative to the experiment folder; keeps its folder-local path.
    ExperimentFile,
    /// Relative to the models library; flattened to its basename.
    Model,
    /// Robot body from the models library; flattened to `robot_id/basename`,
    /// together with the first `.launch` file next to it.
    RobotBody { robot_id: String },
    /// Experiment folder first, models library second.
    Auto,
    /// Already inside the flattened namespace once rewritten to its basename;
    /// nothing to copy.
    RewriteOnly,
}

/// A file reference found in a configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileReference {
    pub slot: Slot,
    pub value: String,
    pub kind: ReferenceKind,
}

/// A loaded configuration, in either dialect.
#[derive(Clone, Debug)]
pub enum ExperimentConfig {
    Json(Value),
    LegacyXml {
        exc: Element,
        bibi: Option<Element>,
    },
}

impl ExperimentConfig {
    /// Parse a root configuration. `.exc` files load as the legacy dialect;
    /// the bibi half is attached later with [`ExperimentConfig::attach_bibi`].
    pub fn parse(file_name: &str, content: &[u8]) -> StorageResult<Self> {
        if file_name.ends_with(EXC_SUFFIX) {
            Ok(Self::LegacyXml {
                exc: parse_xml(content)?,
                bibi: None,
            })
        } else {
            Ok(Self::Json(serde_json::from_slice(content)?))
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::LegacyXml { .. })
    }

    /// Relative path of the bibi file named by the `.exc` document.
    pub fn bibi_reference(&self) -> Option<String> {
        match self {
            Self::LegacyXml { exc, .. } => exc
                .get_child("bibiConf")
                .and_then(|el| el.attributes.get("src"))
                .cloned(),
            Self::Json(_) => None,
        }
    }

    pub fn attach_bibi(&mut self, content: &[u8]) -> StorageResult<()> {
        if let Self::LegacyXml { bibi, .. } = self {
            *bibi = Some(parse_xml(content)?);
        }
        Ok(())
    }

    /// Point the `.exc` document at the flattened bibi file.
    pub fn flatten_bibi_reference(&mut self) {
        if let Self::LegacyXml { exc, .. } = self
            && let Some(el) = exc.get_mut_child("bibiConf")
        {
            el.attributes
                .insert("src".to_string(), FLAT_BIBI_FILE.to_string());
        }
    }

    /// Every file reference, in document order.
    pub fn references(&self) -> Vec<FileReference> {
        let mut refs = Vec::new();
        match self {
            Self::Json(value) => collect_json_references(value, String::new(), None, &mut refs),
            Self::LegacyXml { exc, bibi } => {
                collect_exc_references(exc, &mut refs);
                if let Some(bibi) = bibi {
                    collect_bibi_references(bibi, &mut refs);
                }
            }
        }
        refs
    }

    /// Replace the value stored at `slot`.
    pub fn rewrite(&mut self, slot: &Slot, new_value: &str) -> StorageResult<()> {
        let missing =
            || StorageError::Inconsistency(format!("configuration slot {slot:?} vanished"));
        match (self, slot) {
            (Self::Json(value), Slot::Json(pointer)) => {
                let target = value.pointer_mut(pointer).ok_or_else(missing)?;
                *target = Value::String(new_value.to_string());
            }
            (Self::LegacyXml { exc, bibi }, Slot::XmlAttribute { document, path, attribute }) => {
                let root = pick_document(exc, bibi, *document).ok_or_else(missing)?;
                let el = element_at_mut(root, path).ok_or_else(missing)?;
                el.attributes
                    .insert((*attribute).to_string(), new_value.to_string());
            }
            (Self::LegacyXml { exc, bibi }, Slot::XmlText { document, path }) => {
                let root = pick_document(exc, bibi, *document).ok_or_else(missing)?;
                let el = element_at_mut(root, path).ok_or_else(missing)?;
                set_text(el, new_value);
            }
            _ => return Err(missing()),
        }
        Ok(())
    }

    pub fn name(&self) -> Option<String> {
        match self {
            Self::Json(value) => json_string(value, "SimulationName"),
            Self::LegacyXml { exc, .. } => child_text(exc, "name"),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        match self {
            Self::Json(value) => set_json_string(value, "SimulationName", name),
            Self::LegacyXml { exc, .. } => set_child_text(exc, "name", name),
        }
    }

    pub fn clone_date(&self) -> Option<String> {
        match self {
            Self::Json(value) => json_string(value, "CloneDate"),
            Self::LegacyXml { exc, .. } => child_text(exc, "cloneDate"),
        }
    }

    pub fn set_clone_date(&mut self, date: &str) {
        match self {
            Self::Json(value) => set_json_string(value, "CloneDate", date),
            Self::LegacyXml { exc, .. } => set_child_text(exc, "cloneDate", date),
        }
    }

    /// Display fields shown next to an experiment in listings.
    pub fn summary(&self, config_file: &str) -> ExperimentSummary {
        let (description, thumbnail) = match self {
            Self::Json(value) => (
                json_string(value, "SimulationDescription"),
                json_string(value, "Thumbnail").or_else(|| json_string(value, "thumbnail")),
            ),
            Self::LegacyXml { exc, .. } => {
                (child_text(exc, "description"), child_text(exc, "thumbnail"))
            }
        };
        ExperimentSummary {
            config_file: config_file.to_string(),
            name: self.name(),
            description,
            thumbnail,
            clone_date: self.clone_date(),
        }
    }

    /// Serialized root document.
    pub fn root_bytes(&self) -> StorageResult<Vec<u8>> {
        match self {
            Self::Json(value) => Ok(serde_json::to_vec_pretty(value)?),
            Self::LegacyXml { exc, .. } => write_xml(exc),
        }
    }

    /// Serialized bibi document, when one is attached.
    pub fn bibi_bytes(&self) -> StorageResult<Option<Vec<u8>>> {
        match self {
            Self::LegacyXml { bibi: Some(bibi), .. } => Ok(Some(write_xml(bibi)?)),
            _ => Ok(None),
        }
    }
}

fn parse_xml(content: &[u8]) -> StorageResult<Element> {
    Element::parse(content).map_err(|err| StorageError::Xml(err.to_string()))
}

fn write_xml(element: &Element) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    element
        .write_with_config(&mut out, EmitterConfig::new().perform_indent(true))
        .map_err(|err| StorageError::Xml(err.to_string()))?;
    Ok(out)
}

fn pick_document<'a>(
    exc: &'a mut Element,
    bibi: &'a mut Option<Element>,
    document: XmlDocument,
) -> Option<&'a mut Element> {
    match document {
        XmlDocument::Exc => Some(exc),
        XmlDocument::Bibi => bibi.as_mut(),
    }
}

fn element_at_mut<'a>(root: &'a mut Element, path: &[usize]) -> Option<&'a mut Element> {
    let mut current = root;
    for &index in path {
        current = match current.children.get_mut(index)? {
            XMLNode::Element(el) => el,
            _ => return None,
        };
    }
    Some(current)
}

/// `(index, element)` for every child element called `name`.
fn children_named<'a>(
    parent: &'a Element,
    name: &'a str,
) -> impl Iterator<Item = (usize, &'a Element)> {
    parent
        .children
        .iter()
        .enumerate()
        .filter_map(move |(index, node)| match node {
            XMLNode::Element(el) if el.name == name => Some((index, el)),
            _ => None,
        })
}

fn text_of(el: &Element) -> Option<String> {
    el.get_text()
        .map(Cow::into_owned)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn child_text(parent: &Element, name: &str) -> Option<String> {
    parent.get_child(name).and_then(text_of)
}

fn set_text(el: &mut Element, text: &str) {
    el.children
        .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
    el.children.push(XMLNode::Text(text.to_string()));
}

fn set_child_text(parent: &mut Element, name: &str, text: &str) {
    if let Some(el) = parent.get_mut_child(name) {
        set_text(el, text);
        return;
    }
    let mut el = Element::new(name);
    el.namespace = parent.namespace.clone();
    el.children.push(XMLNode::Text(text.to_string()));
    parent.children.push(XMLNode::Element(el));
}

fn json_string(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn set_json_string(value: &mut Value, key: &str, text: &str) {
    if let Some(object) = value.as_object_mut() {
        object.insert(key.to_string(), Value::String(text.to_string()));
    }
}

fn is_reference_key(key: &str) -> bool {
    key.ends_with("FileName") || key.ends_with("File") || key.eq_ignore_ascii_case("thumbnail")
}

/// Escape a key for use inside a JSON pointer.
fn pointer_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn collect_json_references(
    value: &Value,
    pointer: String,
    key: Option<&str>,
    refs: &mut Vec<FileReference>,
) {
    match value {
        Value::Object(map) => {
            for (child_key, child) in map {
                let child_pointer = format!("{pointer}/{}", pointer_segment(child_key));
                collect_json_references(child, child_pointer, Some(child_key), refs);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_json_references(item, format!("{pointer}/{index}"), key, refs);
            }
        }
        Value::String(text) if key.is_some_and(is_reference_key) && !text.trim().is_empty() => {
            refs.push(FileReference {
                slot: Slot::Json(pointer),
                value: text.clone(),
                kind: ReferenceKind::Auto,
            });
        }
        _ => {}
    }
}

fn attribute_ref(
    document: XmlDocument,
    path: Vec<usize>,
    el: &Element,
    attribute: &'static str,
    kind: ReferenceKind,
    refs: &mut Vec<FileReference>,
) {
    if let Some(value) = el.attributes.get(attribute).filter(|v| !v.trim().is_empty()) {
        refs.push(FileReference {
            slot: Slot::XmlAttribute {
                document,
                path,
                attribute,
            },
            value: value.clone(),
            kind,
        });
    }
}

fn collect_exc_references(exc: &Element, refs: &mut Vec<FileReference>) {
    let doc = XmlDocument::Exc;

    for (control_index, control) in children_named(exc, "experimentControl") {
        for (sm_index, sm) in children_named(control, "stateMachine") {
            attribute_ref(
                doc,
                vec![control_index, sm_index],
                sm,
                "src",
                ReferenceKind::ExperimentFile,
                refs,
            );
        }
    }

    for (index, thumb) in children_named(exc, "thumbnail") {
        if let Some(value) = text_of(thumb) {
            refs.push(FileReference {
                slot: Slot::XmlText { document: doc, path: vec![index] },
                value,
                kind: ReferenceKind::ExperimentFile,
            });
        }
    }

    for (index, env) in children_named(exc, "environmentModel") {
        // Custom environments ship as model archives and are not copied.
        let kind = if env.attributes.contains_key("model") {
            ReferenceKind::RewriteOnly
        } else {
            ReferenceKind::Model
        };
        attribute_ref(doc, vec![index], env, "src", kind, refs);
    }

    for (index, conf) in children_named(exc, "configuration") {
        attribute_ref(doc, vec![index], conf, "src", ReferenceKind::ExperimentFile, refs);
    }

    for (index, launch) in children_named(exc, "rosLaunch") {
        attribute_ref(doc, vec![index], launch, "src", ReferenceKind::ExperimentFile, refs);
    }
}

fn collect_bibi_references(bibi: &Element, refs: &mut Vec<FileReference>) {
    let doc = XmlDocument::Bibi;

    for (index, conf) in children_named(bibi, "configuration") {
        attribute_ref(doc, vec![index], conf, "src", ReferenceKind::ExperimentFile, refs);
    }

    for (index, body) in children_named(bibi, "bodyModel") {
        if let Some(value) = text_of(body) {
            let robot_id = body
                .attributes
                .get("robotId")
                .cloned()
                .unwrap_or_else(|| DEFAULT_ROBOT_ID.to_string());
            refs.push(FileReference {
                slot: Slot::XmlText { document: doc, path: vec![index] },
                value,
                kind: ReferenceKind::RobotBody { robot_id },
            });
        }
    }

    for (brain_index, brain) in children_named(bibi, "brainModel") {
        for (file_index, file) in children_named(brain, "file") {
            if let Some(value) = text_of(file) {
                refs.push(FileReference {
                    slot: Slot::XmlText {
                        document: doc,
                        path: vec![brain_index, file_index],
                    },
                    value,
                    kind: ReferenceKind::Model,
                });
            }
        }
    }

    for (index, tf) in children_named(bibi, "transferFunction") {
        attribute_ref(doc, vec![index], tf, "src", ReferenceKind::ExperimentFile, refs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ExD xmlns="http://schemas.humanbrainproject.eu/SP10/2014/ExDConfig">
    <name>Husky Braitenberg</name>
    <thumbnail>husky.png</thumbnail>
    <description>Husky follows a red screen</description>
    <configuration type="3d-settings" src="husky.ini"/>
    <environmentModel src="virtual_room/virtual_room.sdf"/>
    <bibiConf src="husky.bibi"/>
    <experimentControl>
        <stateMachine id="SM" src="sm.exd"/>
    </experimentControl>
</ExD>"#;

    const BIBI: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bibi xmlns="http://schemas.humanbrainproject.eu/SP10/2014/BIBI">
    <brainModel>
        <file>brain_model/braitenberg.py</file>
    </brainModel>
    <bodyModel robotId="husky">husky_model/model.sdf</bodyModel>
    <transferFunction src="eye.py"/>
</bibi>"#;

    #[test]
    fn picks_json_over_exc() {
        assert_eq!(
            root_config_name(["a.exc", "simulation_config.json"]),
            Some("simulation_config.json")
        );
        assert_eq!(root_config_name(["x.bibi", "a.exc"]), Some("a.exc"));
        assert_eq!(root_config_name(["readme.md"]), None);
    }

    #[test]
    fn legacy_pair_yields_typed_references() {
        let mut config = ExperimentConfig::parse("husky.exc", EXC.as_bytes()).unwrap();
        assert_eq!(config.bibi_reference().as_deref(), Some("husky.bibi"));
        config.attach_bibi(BIBI.as_bytes()).unwrap();

        let refs = config.references();
        let values: Vec<&str> = refs.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(
            values,
            vec![
                "sm.exd",
                "husky.png",
                "virtual_room/virtual_room.sdf",
                "husky.ini",
                "husky_model/model.sdf",
                "brain_model/braitenberg.py",
                "eye.py",
            ]
        );
        assert!(
            refs.iter()
                .any(|r| r.kind == ReferenceKind::RobotBody { robot_id: "husky".into() })
        );
    }

    #[test]
    fn rewrites_land_in_serialized_documents() {
        let mut config = ExperimentConfig::parse("husky.exc", EXC.as_bytes()).unwrap();
        config.attach_bibi(BIBI.as_bytes()).unwrap();
        for reference in config.references() {
            let flat = crate::utils::basename(&reference.value).to_string();
            config.rewrite(&reference.slot, &flat).unwrap();
        }
        config.flatten_bibi_reference();
        config.set_name("copy");
        config.set_clone_date("2024-01-01T10:00:00");

        let exc = String::from_utf8(config.root_bytes().unwrap()).unwrap();
        assert!(exc.contains("virtual_room.sdf\""));
        assert!(!exc.contains("virtual_room/"));
        assert!(exc.contains(FLAT_BIBI_FILE));
        assert!(exc.contains("2024-01-01T10:00:00"));

        let bibi = String::from_utf8(config.bibi_bytes().unwrap().unwrap()).unwrap();
        assert!(bibi.contains(">braitenberg.py<"));
        assert!(!bibi.contains("brain_model/"));
        assert_eq!(config.name().as_deref(), Some("copy"));
    }

    #[test]
    fn json_references_follow_file_keys() {
        let doc = serde_json::json!({
            "SimulationName": "nest",
            "Thumbnail": "thumb.png",
            "EngineConfigs": [
                { "EngineName": "nest", "NestInitFileName": "nest_brain.py" },
                { "EngineName": "gz", "GazeboWorldFile": "worlds/empty.sdf" }
            ],
            "DataPackProcessingFunctions": [ { "Name": "tf", "FileName": "tf_1.py" } ]
        });
        let mut config = ExperimentConfig::Json(doc);
        let refs = config.references();
        assert_eq!(refs.len(), 4);

        let world = refs.iter().find(|r| r.value == "worlds/empty.sdf").unwrap();
        config.rewrite(&world.slot, "empty.sdf").unwrap();
        let ExperimentConfig::Json(value) = &config else { unreachable!() };
        assert_eq!(value["EngineConfigs"][1]["GazeboWorldFile"], "empty.sdf");

        let summary = config.summary(JSON_CONFIG_FILE);
        assert_eq!(summary.name.as_deref(), Some("nest"));
        assert_eq!(summary.thumbnail.as_deref(), Some("thumb.png"));
    }
}
