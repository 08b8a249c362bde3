//! Drive paths and the folder-marker encoding.
//!
//! The store only holds leaves, so an empty folder is kept alive by a
//! zero-byte `.keep` entry inside it. Everything that knows about `.keep`
//! lives here; listings never expose markers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use peerdrive_shared::constants::FOLDER_MARKER;
use peerdrive_store::Entry;

use crate::error::{CoreError, Result};

pub struct FolderMarker;

impl FolderMarker {
    pub fn is_marker(path: &str) -> bool {
        file_name(path) == FOLDER_MARKER
    }

    pub fn marker_path(folder: &str) -> String {
        join(folder, FOLDER_MARKER)
    }

    /// The folder a marker keeps alive.
    pub fn folder_of(marker: &str) -> Option<&str> {
        Self::is_marker(marker).then(|| parent(marker))
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Canonical form of a caller-supplied drive path: absolute, no empty, `.`
/// or `..` segments, no trailing slash (except the root).
pub fn normalize_path(raw: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(CoreError::Validation(format!("path must be absolute: {raw:?}")));
    }
    if raw.contains('\0') || raw.contains('\\') {
        return Err(CoreError::Validation(format!("invalid character in path: {raw:?}")));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(CoreError::Validation(format!("relative segment in path: {raw:?}")));
        }
        segments.push(segment);
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Validate a relative path (file name or `a/b/c`) to be placed under a folder.
pub fn normalize_relative(raw: &str) -> Result<String> {
    let trimmed = raw.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(CoreError::Validation("empty file name".into()));
    }
    normalize_path(&format!("/{trimmed}")).map(|p| p[1..].to_string())
}

pub fn join(folder: &str, name: &str) -> String {
    if folder == "/" {
        format!("/{name}")
    } else {
        format!("{folder}/{name}")
    }
}

pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `folder` with a trailing slash, the prefix shared by everything inside it.
fn child_prefix(folder: &str) -> String {
    if folder == "/" {
        "/".to_string()
    } else {
        format!("{folder}/")
    }
}

/// Every folder strictly between `folder` and `path`.
pub(crate) fn folders_between(folder: &str, path: &str) -> Vec<String> {
    let mut folders = Vec::new();
    let mut current = parent(path);
    while current != folder && current.len() > folder.len() {
        folders.push(current.to_string());
        current = parent(current);
    }
    folders
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryValue {
    pub kind: EntryKind,
    pub size: u64,
    pub seq: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// One row of a folder listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub value: EntryValue,
}

impl ListEntry {
    fn file(entry: &Entry) -> Self {
        Self {
            key: entry.path.clone(),
            value: EntryValue {
                kind: EntryKind::File,
                size: entry.size(),
                seq: Some(entry.seq),
                modified_at: Some(entry.modified_at),
            },
        }
    }

    fn folder(path: String) -> Self {
        Self {
            key: path,
            value: EntryValue {
                kind: EntryKind::Folder,
                size: 0,
                seq: None,
                modified_at: None,
            },
        }
    }

    pub fn is_folder(&self) -> bool {
        self.value.kind == EntryKind::Folder
    }
}

/// Entries at (`recursive = false`) or under (`recursive = true`) `folder`,
/// ordered by key. Folders come from markers and from deeper paths; markers
/// themselves are never returned.
pub fn list_folder(entries: &[Entry], folder: &str, recursive: bool) -> Vec<ListEntry> {
    let prefix = child_prefix(folder);
    let mut listing: BTreeMap<String, ListEntry> = BTreeMap::new();

    for entry in entries.iter().filter(|e| e.path.starts_with(&prefix)) {
        let rest = &entry.path[prefix.len()..];

        if recursive {
            for dir in folders_between(folder, &entry.path) {
                listing
                    .entry(dir.clone())
                    .or_insert_with(|| ListEntry::folder(dir));
            }
            if !FolderMarker::is_marker(&entry.path) {
                listing.insert(entry.path.clone(), ListEntry::file(entry));
            }
            continue;
        }

        match rest.split_once('/') {
            Some((child, _)) => {
                let dir = join(folder, child);
                listing
                    .entry(dir.clone())
                    .or_insert_with(|| ListEntry::folder(dir));
            }
            None if rest == FOLDER_MARKER => {}
            None => {
                listing.insert(entry.path.clone(), ListEntry::file(entry));
            }
        }
    }

    listing.into_values().collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FolderStats {
    pub file_count: usize,
    pub folder_count: usize,
    pub total_bytes: u64,
}

pub fn folder_stats(entries: &[Entry], folder: &str) -> FolderStats {
    let prefix = child_prefix(folder);
    let mut folders = BTreeSet::new();
    let mut stats = FolderStats::default();

    for entry in entries.iter().filter(|e| e.path.starts_with(&prefix)) {
        folders.extend(folders_between(folder, &entry.path));
        if !FolderMarker::is_marker(&entry.path) {
            stats.file_count += 1;
            stats.total_bytes += entry.size();
        }
    }
    stats.folder_count = folders.len();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> Entry {
        let blob = (size > 0).then(|| peerdrive_shared::protocol::BlobRef {
            hash: [size as u8; 32],
            size,
        });
        Entry {
            path: path.into(),
            blob,
            seq: 1,
            modified_at: Utc::now(),
        }
    }

    fn keys(listing: &[ListEntry]) -> Vec<&str> {
        listing.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/a//b/").unwrap(), "/a/b");
        assert!(normalize_path("a/b").is_err());
        assert!(normalize_path("/a/../b").is_err());
        assert!(normalize_path("/a/./b").is_err());
        assert_eq!(normalize_relative("x/y.txt").unwrap(), "x/y.txt");
        assert!(normalize_relative("").is_err());
        assert!(normalize_relative("../up").is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(FolderMarker::marker_path("/docs"), "/docs/.keep");
        assert_eq!(FolderMarker::folder_of("/docs/.keep"), Some("/docs"));
        assert_eq!(FolderMarker::folder_of("/docs/a.txt"), None);
    }

    #[test]
    fn test_shallow_listing_hides_markers() {
        let entries = vec![
            entry("/a.txt", 3),
            entry("/docs/.keep", 0),
            entry("/docs/deep/b.txt", 4),
            entry("/.keep", 0),
        ];
        let listing = list_folder(&entries, "/", false);
        assert_eq!(keys(&listing), vec!["/a.txt", "/docs"]);
        assert!(listing[1].is_folder());

        let inner = list_folder(&entries, "/docs", false);
        assert_eq!(keys(&inner), vec!["/docs/deep"]);
    }

    #[test]
    fn test_recursive_listing_turns_markers_into_folders() {
        let entries = vec![
            entry("/docs/.keep", 0),
            entry("/docs/empty/.keep", 0),
            entry("/docs/x/y/z.txt", 1),
            entry("/other.txt", 1),
        ];
        let listing = list_folder(&entries, "/docs", true);
        assert_eq!(
            keys(&listing),
            vec!["/docs/empty", "/docs/x", "/docs/x/y", "/docs/x/y/z.txt"]
        );
    }

    #[test]
    fn test_prefix_does_not_match_siblings() {
        let entries = vec![entry("/doc/a", 1), entry("/docs/b", 1)];
        assert_eq!(keys(&list_folder(&entries, "/doc", true)), vec!["/doc/a"]);
    }

    #[test]
    fn test_folder_stats() {
        let entries = vec![
            entry("/p/.keep", 0),
            entry("/p/a", 10),
            entry("/p/q/b", 5),
            entry("/p/r/.keep", 0),
        ];
        let stats = folder_stats(&entries, "/p");
        assert_eq!(
            stats,
            FolderStats {
                file_count: 2,
                folder_count: 2,
                total_bytes: 15
            }
        );
    }
}
