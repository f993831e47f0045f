//! Scanner module for discovering candidate video files.
//!
//! Walks the given paths recursively, skipping hidden directories and the
//! artifacts this tool leaves behind (`TEMP.`, `ORIG.`, `SAMPLE.` files).

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Video file extensions accepted by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".wmv", ".flv", ".webm", ".ts", ".m2ts", ".mpg",
    ".mpeg",
];

/// File-name prefixes of outputs and backups written by the supervisor.
pub const ARTIFACT_PREFIXES: &[&str] = &["TEMP.", "ORIG.", "SAMPLE."];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Whether the file is one of our own temp outputs, backups or samples.
pub fn is_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p)))
}

/// Collect candidate video files under `roots`.
///
/// A root that is itself a file is taken as-is if it qualifies. Results are
/// sorted and free of duplicates.
pub fn scan_paths(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();

    for root in roots {
        if !root.exists() {
            log::warn!("skipping missing path {}", root.display());
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            // Allow the root itself even if it starts with '.'
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry.file_name().to_str().is_some_and(|n| n.starts_with('.')))
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_type().is_file() && is_video_file(path) && !is_artifact(path) {
                found.push(path.to_path_buf());
            }
        }
    }

    found.sort();
    found.dedup();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/a/film.mkv")));
        assert!(is_video_file(Path::new("/a/FILM.MP4")));
        assert!(!is_video_file(Path::new("/a/film.srt")));
        assert!(!is_video_file(Path::new("/a/film")));
    }

    #[test]
    fn test_is_artifact() {
        assert!(is_artifact(Path::new("/a/TEMP.film.mkv")));
        assert!(is_artifact(Path::new("/a/ORIG.film.mp4")));
        assert!(is_artifact(Path::new("/tmp/SAMPLE.28.film.mkv")));
        assert!(!is_artifact(Path::new("/a/temp.film.mkv")));
        assert!(!is_artifact(Path::new("/a/film.mkv")));
    }

    #[test]
    fn test_scan_skips_hidden_dirs_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("show/season1")).unwrap();
        fs::create_dir_all(root.join(".trash")).unwrap();

        for name in [
            "movie.mp4",
            "show/season1/e01.mkv",
            "show/season1/e01.en.srt",
            "show/season1/TEMP.e02.mkv",
            "ORIG.old.avi",
            ".trash/deleted.mkv",
            ".hidden-file.mkv",
        ] {
            File::create(root.join(name)).unwrap();
        }

        let found = scan_paths(&[root.to_path_buf()]);
        assert_eq!(
            found,
            vec![
                root.join(".hidden-file.mkv"),
                root.join("movie.mp4"),
                root.join("show/season1/e01.mkv"),
            ]
        );
    }

    #[test]
    fn test_scan_accepts_file_roots_and_dedups() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        File::create(&file).unwrap();

        let found = scan_paths(&[
            file.clone(),
            dir.path().to_path_buf(),
            dir.path().join("missing"),
        ]);
        assert_eq!(found, vec![file]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_artifact_prefix_always_excluded(
            prefix in prop::sample::select(ARTIFACT_PREFIXES.to_vec()),
            stem in "[a-zA-Z0-9 _-]{1,20}",
            ext in prop::sample::select(VIDEO_EXTENSIONS.to_vec()),
        ) {
            let name = format!("{}{}{}", prefix, stem, ext);
            let path = Path::new("/library").join(&name);
            prop_assert!(is_video_file(&path));
            prop_assert!(is_artifact(&path));
        }
    }
}
