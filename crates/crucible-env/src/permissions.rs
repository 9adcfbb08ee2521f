//! Post-clone binary re-permissioning
//!
//! A raw file copy loses executable bits, and on macOS the copied binaries
//! carry stale code signatures. Environments cloned from the master must be
//! re-permissioned (and re-signed on macOS) before first use. This is a
//! correctness requirement on non-Windows platforms, not an optimization.

use std::path::Path;

use anyhow::Result;
use tracing::debug;

/// Restore executable bits (and signatures, on macOS) for an environment
pub async fn fix_permissions(env_dir: &Path) -> Result<()> {
    if cfg!(windows) {
        return Ok(());
    }
    fix_unix_permissions(env_dir)?;
    #[cfg(target_os = "macos")]
    resign_binaries(env_dir).await?;
    Ok(())
}

#[cfg(unix)]
fn fix_unix_permissions(env_dir: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let bin_dir = env_dir.join("bin");
    if !bin_dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&bin_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))?;
            debug!("Marked executable: {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn fix_unix_permissions(_env_dir: &Path) -> Result<()> {
    Ok(())
}

/// Ad-hoc re-sign every binary; stale signatures make the loader reject them
#[cfg(target_os = "macos")]
async fn resign_binaries(env_dir: &Path) -> Result<()> {
    use crucible_core::{proc, CancelToken, OutputSink};
    use tracing::warn;

    let bin_dir = env_dir.join("bin");
    if !bin_dir.is_dir() {
        return Ok(());
    }

    for entry in std::fs::read_dir(&bin_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path().display().to_string();
        let result = proc::run_logged(
            "codesign",
            &["--force", "--sign", "-", &path],
            env_dir,
            &OutputSink::discard(),
            &CancelToken::new(),
        )
        .await;
        if let Err(err) = result {
            warn!("Failed to re-sign {}: {}", path, err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fix_permissions_sets_executable_bits() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let binary = bin.join("python");
        fs::write(&binary, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o644)).unwrap();

        fix_permissions(dir.path()).await.unwrap();

        let mode = fs::metadata(&binary).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_missing_bin_dir_is_fine() {
        let dir = tempfile::TempDir::new().unwrap();
        fix_permissions(dir.path()).await.unwrap();
    }
}
