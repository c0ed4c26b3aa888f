/// Media library scan
///
/// Walks the input tree for playable video files and applies the exclusion
/// rules up front. Tier classification happens later, in the selector —
/// exclusion is independent of weighting.
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::settings::PathRules;

pub const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "mkv", "avi", "mov", "flv", "wmv", "webm"];

/// One playable file: its absolute path plus the lower-cased path relative
/// to the input dir that every path rule matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryEntry {
    pub path: PathBuf,
    pub rel_lower: String,
}

/// Why a scan produced nothing. The three causes get distinct diagnostics
/// because they require different operator fixes.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("input dir {0} contains no files at all")]
    EmptyPool(PathBuf),
    #[error("input dir {0} has files, but none with a playable video extension")]
    NoMatchingExtensions(PathBuf),
    #[error("all playable files under {0} are excluded by the current rules")]
    AllExcluded(PathBuf),
}

fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_lowercase();
            VIDEO_EXTENSIONS.iter().any(|v| *v == lower)
        })
        .unwrap_or(false)
}

/// Scan `input_dir` recursively for video files not matching `exclude`.
/// Results are sorted by relative path for deterministic selection state.
pub fn scan(input_dir: &Path, exclude: &PathRules) -> Result<Vec<LibraryEntry>, ScanError> {
    let mut any_file = false;
    let mut any_video = false;
    let mut entries = Vec::new();

    for entry in WalkDir::new(input_dir).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("scan: skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        any_file = true;
        if !has_video_extension(entry.path()) {
            continue;
        }
        any_video = true;

        let rel_lower = entry
            .path()
            .strip_prefix(input_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/")
            .to_lowercase();
        if !exclude.is_empty() && exclude.matches(&rel_lower) {
            continue;
        }
        entries.push(LibraryEntry { path: entry.path().to_path_buf(), rel_lower });
    }

    if entries.is_empty() {
        return Err(if !any_file {
            ScanError::EmptyPool(input_dir.to_path_buf())
        } else if !any_video {
            ScanError::NoMatchingExtensions(input_dir.to_path_buf())
        } else {
            ScanError::AllExcluded(input_dir.to_path_buf())
        });
    }

    entries.sort_by(|a, b| a.rel_lower.cmp(&b.rel_lower));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn finds_video_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.mp4");
        touch(dir.path(), "nested/deep/b.MKV");
        touch(dir.path(), "notes.txt");

        let entries = scan(dir.path(), &PathRules::default()).unwrap();
        let rels: Vec<&str> = entries.iter().map(|e| e.rel_lower.as_str()).collect();
        assert_eq!(rels, vec!["a.mp4", "nested/deep/b.mkv"]);
    }

    #[test]
    fn empty_dir_is_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            scan(dir.path(), &PathRules::default()),
            Err(ScanError::EmptyPool(_))
        ));
    }

    #[test]
    fn only_non_video_files_is_no_matching_extensions() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "readme.md");
        touch(dir.path(), "cover.jpg");
        assert!(matches!(
            scan(dir.path(), &PathRules::default()),
            Err(ScanError::NoMatchingExtensions(_))
        ));
    }

    #[test]
    fn everything_excluded_is_all_excluded() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "shows/a.mp4");
        let exclude = PathRules::from_csv("shows/", "", "", "");
        assert!(matches!(scan(dir.path(), &exclude), Err(ScanError::AllExcluded(_))));
    }

    #[test]
    fn exclusion_applies_to_relative_lowercased_path() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Shows/a.mp4");
        touch(dir.path(), "movies/b.mp4");
        let exclude = PathRules::from_csv("shows/", "", "", "");
        let entries = scan(dir.path(), &exclude).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel_lower, "movies/b.mp4");
    }
}
