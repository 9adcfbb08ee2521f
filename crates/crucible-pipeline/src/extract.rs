//! Archive extraction via the platform archive tool
//!
//! The pipeline does not implement a compression codec; it shells out to
//! `tar`, `unzip`, or `7z` by extension. A corrupt or incomplete archive
//! fails extraction, and partial output is deleted so a retry starts clean.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crucible_core::types::{DownloadFile, ProgressReporter};
use crucible_core::{proc, CancelToken, Error, OutputSink};

use crate::download::Downloader;

/// Progress phase name used by extraction events
pub const PHASE_EXTRACT: &str = "extract";

/// Pick the archive tool and argv for the given archive
fn archive_command(archive: &Path, dest: &Path) -> Result<(String, Vec<String>)> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let archive_arg = archive.display().to_string();
    let dest_arg = dest.display().to_string();

    let (tool, args) = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ("tar", vec!["-xzf".into(), archive_arg, "-C".into(), dest_arg])
    } else if name.ends_with(".tar") {
        ("tar", vec!["-xf".into(), archive_arg, "-C".into(), dest_arg])
    } else if name.ends_with(".zip") {
        ("unzip", vec!["-o".into(), archive_arg, "-d".into(), dest_arg])
    } else if name.ends_with(".7z") {
        ("7z", vec!["x".into(), archive_arg, format!("-o{}", dest_arg), "-y".into()])
    } else {
        return Err(anyhow!(Error::extraction_failed(format!(
            "Unsupported archive format: {}",
            name
        ))));
    };

    which::which(tool)
        .map_err(|_| anyhow!(Error::extraction_failed(format!("{} not found on PATH", tool))))?;

    Ok((tool.to_string(), args))
}

/// Extract one archive into `dest`, deleting `dest` on failure
pub async fn extract(archive: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let (tool, args) = archive_command(archive, dest)?;
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

    debug!("Extracting {} with {}", archive.display(), tool);
    let result = proc::run_logged(
        &tool,
        &arg_refs,
        dest.parent().unwrap_or(Path::new(".")),
        &OutputSink::discard(),
        cancel,
    )
    .await;

    if let Err(err) = result {
        warn!("Extraction failed, removing partial output: {}", dest.display());
        let _ = fs::remove_dir_all(dest);
        return Err(anyhow!(err).context(format!("Failed to extract {}", archive.display())));
    }

    Ok(())
}

impl Downloader {
    /// Download and extract a whole release set into `dest`, all-or-nothing
    ///
    /// Files are fetched and unpacked into a staging directory beside `dest`,
    /// which is swapped into place only after every archive extracted. A
    /// failure part way through leaves a pre-existing `dest` untouched — an
    /// update that dies mid-flight must not destroy the launchable prior
    /// bundle. Cached archives survive for the retry.
    pub async fn fetch_and_extract_all(
        &self,
        release_id: &str,
        files: &[DownloadFile],
        dest: &Path,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let staging = sibling(dest, "staging");
        let _ = fs::remove_dir_all(&staging);
        fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        let archives = match self
            .fetch_and_extract_inner(release_id, files, &staging, reporter, cancel)
            .await
        {
            Ok(archives) => archives,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        swap_in(&staging, dest)?;
        info!(
            "Extracted {} archive(s) into {}",
            archives.len(),
            dest.display()
        );
        Ok(archives)
    }

    async fn fetch_and_extract_inner(
        &self,
        release_id: &str,
        files: &[DownloadFile],
        dest: &Path,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        let total_bytes: u64 = files.iter().map(|f| f.expected_size).sum();
        let mut done_bytes: u64 = 0;
        let mut archives = Vec::with_capacity(files.len());

        for file in files {
            cancel.err_if_cancelled()?;
            let archive = self
                .fetch_one(release_id, file, total_bytes, &mut done_bytes, reporter, cancel)
                .await?;
            reporter.indeterminate(PHASE_EXTRACT, file.filename.as_str());
            extract(&archive, dest, cancel).await?;
            archives.push(archive);
        }

        Ok(archives)
    }
}

/// Sibling path of `dest` with a dotted suffix
fn sibling(dest: &Path, suffix: &str) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bundle");
    dest.with_file_name(format!("{}.{}", name, suffix))
}

/// Replace `dest` with the fully-extracted staging tree
///
/// The previous tree is moved aside first and put back if the swap fails,
/// so `dest` is never left missing.
fn swap_in(staging: &Path, dest: &Path) -> Result<()> {
    let previous = sibling(dest, "previous");
    let _ = fs::remove_dir_all(&previous);

    let had_previous = dest.exists();
    if had_previous {
        fs::rename(dest, &previous)
            .with_context(|| format!("Failed to move {} aside", dest.display()))?;
    }
    if let Err(err) = fs::rename(staging, dest) {
        if had_previous {
            let _ = fs::rename(&previous, dest);
        }
        return Err(anyhow!(err)
            .context(format!("Failed to move staged tree into {}", dest.display())));
    }
    let _ = fs::remove_dir_all(&previous);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_command_by_extension() {
        let dest = Path::new("/tmp/out");
        let (tool, args) = archive_command(Path::new("/tmp/a.tar.gz"), dest).unwrap();
        assert_eq!(tool, "tar");
        assert_eq!(args[0], "-xzf");

        let (tool, _) = archive_command(Path::new("/tmp/b.tar"), dest).unwrap();
        assert_eq!(tool, "tar");
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let err = archive_command(Path::new("/tmp/a.rar"), Path::new("/tmp/out")).unwrap_err();
        assert!(err.to_string().contains("Unsupported archive format"));
    }
}
