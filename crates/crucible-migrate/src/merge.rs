//! Non-destructive file-tree merge

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crucible_core::CancelToken;

/// Counts from one merge; `copied + skipped` equals the number of files in
/// the source tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub copied: usize,
    pub skipped: usize,
}

/// Merge `src` into `dest`, copying only files absent at the destination
///
/// Existing destination files are never touched, whatever their content.
pub fn merge_tree(src: &Path, dest: &Path, cancel: &CancelToken) -> Result<MergeCounts> {
    let mut counts = MergeCounts::default();

    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        cancel.err_if_cancelled()?;

        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        if target.exists() {
            counts.skipped += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("Failed to copy {}", rel.display()))?;
        counts.copied += 1;
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_count(tree: &Path) -> usize {
        WalkDir::new(tree)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_counts_sum_to_source_file_count() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("nested").join("b.txt"), b"b").unwrap();
        fs::write(src.join("c.txt"), b"c").unwrap();
        fs::write(dest.join("a.txt"), b"existing").unwrap();

        let counts = merge_tree(&src, &dest, &CancelToken::new()).unwrap();

        assert_eq!(counts.copied, 2);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.copied + counts.skipped, file_count(&src));
    }

    #[test]
    fn test_existing_files_are_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("config.json"), b"incoming").unwrap();
        fs::write(dest.join("config.json"), b"precious").unwrap();

        merge_tree(&src, &dest, &CancelToken::new()).unwrap();

        assert_eq!(fs::read(dest.join("config.json")).unwrap(), b"precious");
    }

    #[test]
    fn test_cancel_stops_merge() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = merge_tree(&src, &dir.path().join("dest"), &cancel).unwrap_err();
        assert!(err
            .downcast_ref::<crucible_core::Error>()
            .is_some_and(crucible_core::Error::is_cancelled));
    }
}
