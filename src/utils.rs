//! Path and naming helpers shared by the backends and the cloner.
//!
//! Everything in here is free of storage state: name generation, timestamp
//! formatting, extension classification, directory walks and in-memory zip
//! construction.

use std::{
    collections::BTreeSet,
    io::{Cursor, Read, Write},
    path::{Component, Path, PathBuf},
};

use chrono::Local;
use walkdir::WalkDir;
use zip::{ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

use crate::errors::{StorageError, StorageResult};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// First `{base}_{n}` (n = 0, 1, …) that is not in `existing`.
pub fn unique_name<'a, I>(base: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: BTreeSet<&str> = existing.into_iter().collect();
    (0usize..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("{base}_0"))
}

/// `name` itself if free, otherwise `{stem}_{n}.{ext}` with the first free n.
///
/// `name` may carry folders; only the file name part is suffixed.
pub fn unique_file_name(name: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned());

    (0usize..)
        .map(|n| {
            let file = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            match &parent {
                Some(parent) => format!("{parent}/{file}"),
                None => file,
            }
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Timestamp stamped into cloned configurations, e.g. `2024-03-07T09:41:05`.
pub fn current_time_and_date() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

pub fn is_image(path: &str) -> bool {
    extension(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// MIME type guessed from the extension, `text/plain` when unknown.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("text/plain")
        .to_string()
}

/// Last path segment of a `/` separated path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Join key segments with `/`, ignoring empty ones.
pub fn join_key<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    parts
        .into_iter()
        .flat_map(|part| part.split('/'))
        .filter(|seg| !seg.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalise a caller supplied relative path.
///
/// Fails with Authorization for absolute paths, drive prefixes and any
/// `..` segment, so the result can be joined under a root without escaping
/// it. `.` segments are dropped.
pub fn sanitize_relative_path(path: &str) -> StorageResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::Authorization(format!(
                    "path `{path}` escapes the storage root"
                )));
            }
        }
    }
    Ok(clean)
}

/// Files below `dir`, as `/` separated paths relative to `dir`, sorted.
///
/// Blocking; async callers should run it on `spawn_blocking`.
pub fn walk_files(dir: &Path) -> StorageResult<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| {
            StorageError::Io(err.into_io_error().unwrap_or_else(|| {
                std::io::Error::other(format!("failed to walk {}", dir.display()))
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(dir) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(parts.join("/"));
        }
    }
    files.sort();
    Ok(files)
}

/// Build a zip archive in memory from `(path, bytes)` pairs.
///
/// Paths are stored as given, so callers decide on the root folder.
pub fn build_zip<'a, I>(entries: I) -> StorageResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        writer.start_file(name, options)?;
        writer.write_all(data)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Largest single member the zip readers decompress.
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;
/// Largest total an archive may expand to.
pub const MAX_ARCHIVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// `/` separated member path, or Validation when it escapes the root.
fn member_path(enclosed: Option<PathBuf>, raw: &str) -> StorageResult<String> {
    let Some(path) = enclosed else {
        return Err(StorageError::Validation(format!(
            "zip entry `{raw}` escapes the archive root"
        )));
    };
    Ok(path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Read at most `limit` bytes. The size declared by the archive is not trusted.
fn read_member<R: Read>(member: &mut R, name: &str, limit: u64) -> StorageResult<Vec<u8>> {
    let mut data = Vec::new();
    member.by_ref().take(limit + 1).read_to_end(&mut data)?;
    if data.len() as u64 > limit {
        return Err(StorageError::Validation(format!(
            "zip entry `{name}` expands beyond {limit} bytes"
        )));
    }
    Ok(data)
}

/// Decompress every file member of an in-memory archive.
///
/// Members whose name would escape the extraction root are rejected with
/// Validation. Directory members are skipped; their files carry the path.
pub fn read_zip_entries(archive: &[u8]) -> StorageResult<Vec<(String, Vec<u8>)>> {
    read_entries_within(archive, MAX_ENTRY_BYTES, MAX_ARCHIVE_BYTES)
}

fn read_entries_within(
    archive: &[u8],
    entry_limit: u64,
    total_limit: u64,
) -> StorageResult<Vec<(String, Vec<u8>)>> {
    let mut reader = ZipArchive::new(Cursor::new(archive))?;
    let mut entries = Vec::with_capacity(reader.len());
    let mut remaining = total_limit;
    for index in 0..reader.len() {
        let mut member = reader.by_index(index)?;
        if member.is_dir() {
            continue;
        }
        let name = member_path(member.enclosed_name(), member.name())?;
        let data = read_member(&mut member, &name, entry_limit.min(remaining))?;
        remaining -= data.len() as u64;
        entries.push((name, data));
    }
    Ok(entries)
}

/// Names of every file member, in archive order, without decompressing.
pub fn zip_entry_names(archive: &[u8]) -> StorageResult<Vec<String>> {
    let mut reader = ZipArchive::new(Cursor::new(archive))?;
    let mut names = Vec::with_capacity(reader.len());
    for index in 0..reader.len() {
        let member = reader.by_index_raw(index)?;
        if !member.is_dir() {
            names.push(member_path(member.enclosed_name(), member.name())?);
        }
    }
    Ok(names)
}

/// Decompress the single member stored as `name`, if present.
pub fn read_zip_entry(archive: &[u8], name: &str) -> StorageResult<Option<Vec<u8>>> {
    let mut reader = ZipArchive::new(Cursor::new(archive))?;
    let mut member = match reader.by_name(name) {
        Ok(member) => member,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    read_member(&mut member, name, MAX_ENTRY_BYTES).map(Some)
}

/// Distinct first path segments of archive members that live inside a folder.
pub fn zip_root_folders<'a, I>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|name| {
            let mut parts = name.splitn(2, '/');
            let root = parts.next()?;
            parts.next()?;
            (!root.is_empty()).then(|| root.to_string())
        })
        .collect()
}
