//! Mapping between remote keys and local filesystem paths

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use crate::s3::error::{Result, StorageError};
use crate::s3::types::LocalPathPlan;

/// Stem used when sanitising leaves nothing behind
const FALLBACK_STEM: &str = "object";

/// Plan where `remote_key` lands under `local_root`.
///
/// The key segments after `prefix` become subdirectories of `local_root`;
/// the prefix is compared on whole segments and a trailing `/` is ignored.
/// A prefix ending mid-segment (`videos/2024-`) strips only its directory
/// part, so `videos/2024-01/a.mp4` lands at `2024-01/a.mp4`. A key outside
/// the prefix keeps only its file name. The file stem is reduced to
/// `[A-Za-z0-9-]`; the extension is kept as is. `.` and `..` segments are
/// dropped so the plan never leaves `local_root`.
pub fn resolve(remote_key: &str, local_root: &Path, prefix: &str) -> Result<LocalPathPlan> {
    if remote_key.is_empty() {
        return Err(StorageError::format("cannot resolve an empty key"));
    }
    if remote_key.ends_with('/') {
        return Err(StorageError::format(format!(
            "'{}' is a folder marker, not a file",
            remote_key
        )));
    }

    let segments: Vec<&str> = remote_key.split('/').collect();
    let prefix_segments = non_empty_segments(prefix);
    let prefix_dir = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
    let dir_segments = non_empty_segments(prefix_dir);

    let depth = if starts_with_segments(&segments, &prefix_segments) {
        prefix_segments.len()
    } else if remote_key.starts_with(prefix) && starts_with_segments(&segments, &dir_segments) {
        dir_segments.len()
    } else {
        segments.len() - 1
    };
    let relative = &segments[depth..];

    let (file_name, parents) = match relative.split_last() {
        Some(split) => split,
        None => return Err(StorageError::format(format!("'{}' has no file name", remote_key))),
    };

    let mut directories_to_create = Vec::new();
    let mut relative_dir = PathBuf::new();
    for segment in parents.iter().filter(|s| is_plain_segment(s)) {
        relative_dir.push(segment);
        directories_to_create.push(relative_dir.clone());
    }

    Ok(LocalPathPlan {
        absolute_path: local_root.join(&relative_dir).join(sanitize_file_name(file_name)),
        directories_to_create,
    })
}

fn non_empty_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// True when `segments` has at least one segment beyond `leading`
fn starts_with_segments(segments: &[&str], leading: &[&str]) -> bool {
    segments.len() > leading.len() && segments[..leading.len()] == *leading
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".."
}

/// Strip everything outside `[A-Za-z0-9-]` from the stem, keeping the extension.
///
/// Distinct names can collapse to the same result (`a (1).pdf` and `a1.pdf`
/// both become `a1.pdf`); `BucketManager::download_prefix` refuses such
/// batches rather than overwrite one file with another.
pub fn sanitize_file_name(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let clean: String = stem.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect();

    if clean.is_empty() {
        format!("{}{}", FALLBACK_STEM, ext)
    } else {
        format!("{}{}", clean, ext)
    }
}

/// Split at the last `.`, treating leading dots as part of the stem
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if name[..idx].chars().any(|c| c != '.') => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Local path for a single-object download.
///
/// An empty destination, one ending in a path separator, or an existing
/// directory receives the key's file name; anything else is used as the
/// literal file path.
pub fn destination_for(remote_key: &str, local_destination: &Path) -> Result<PathBuf> {
    let file_name = remote_key
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| StorageError::format(format!("'{}' does not name a file", remote_key)))?;

    let raw = local_destination.to_string_lossy();
    let is_directory = raw.is_empty()
        || raw.ends_with(MAIN_SEPARATOR)
        || raw.ends_with('/')
        || local_destination.is_dir();

    if is_directory {
        Ok(local_destination.join(file_name))
    } else {
        Ok(local_destination.to_path_buf())
    }
}

/// Create the planned directories under `local_root`; existing ones are fine
pub async fn ensure_directories(local_root: &Path, plan: &LocalPathPlan) -> Result<()> {
    // create_dir_all covers every outer level
    let deepest = plan
        .directories_to_create
        .last()
        .map(|dir| local_root.join(dir))
        .unwrap_or_else(|| local_root.to_path_buf());

    tokio::fs::create_dir_all(&deepest)
        .await
        .map_err(|e| StorageError::io(&deepest, e))
}

/// Remote key for a file found `relative_path` below an uploaded directory
pub fn upload_key(key_prefix: &str, relative_path: &Path) -> String {
    let relative: Vec<String> = relative_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().replace('\\', "/")),
            _ => None,
        })
        .collect();
    let relative = relative.join("/");

    let prefix = key_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix, relative)
    }
}
