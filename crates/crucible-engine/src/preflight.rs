//! Pre-flight checks run after the action chain, before dispatch
//!
//! Precondition failures are detected before any destructive step and
//! surfaced as structured results, not generic error strings.

use std::net::TcpListener;
use std::path::Path;

use anyhow::{anyhow, Result};
use tracing::debug;

use crucible_core::types::PortConflict;
use crucible_core::Error;

/// Ports probed past a contested one when looking for an alternative
const NEXT_FREE_SCAN: u16 = 50;

/// Fail unless the filesystem holding `path` has `required` bytes free
///
/// The path itself may not exist yet (fresh install target); the check
/// walks up to the nearest existing ancestor.
pub fn check_disk_space(path: &Path, required: u64) -> Result<()> {
    let mut probe = path;
    while !probe.exists() {
        probe = match probe.parent() {
            Some(parent) => parent,
            None => Path::new("."),
        };
        if probe == Path::new("") {
            probe = Path::new(".");
        }
    }

    let available = fs4::available_space(probe)?;
    debug!(
        "Disk pre-flight at {}: {} required, {} available",
        probe.display(),
        required,
        available
    );
    if available < required {
        return Err(anyhow!(Error::InsufficientDiskSpace {
            required,
            available,
        }));
    }
    Ok(())
}

/// Check whether a port is free; a conflict carries the next free port
pub fn check_port(port: u16) -> Option<PortConflict> {
    if bindable(port) {
        return None;
    }
    let next_free = (port.saturating_add(1)..=port.saturating_add(NEXT_FREE_SCAN))
        .find(|candidate| bindable(*candidate));
    Some(PortConflict { port, next_free })
}

fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_required_bytes_always_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        check_disk_space(dir.path(), 0).unwrap();
    }

    #[test]
    fn test_absurd_requirement_fails_with_structured_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = check_disk_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InsufficientDiskSpace { .. })
        ));
    }

    #[test]
    fn test_nonexistent_target_walks_up_to_ancestor() {
        let dir = tempfile::TempDir::new().unwrap();
        check_disk_space(&dir.path().join("not").join("yet").join("there"), 0).unwrap();
    }

    #[test]
    fn test_contested_port_reports_next_free() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let conflict = check_port(port).expect("port should be contested");
        assert_eq!(conflict.port, port);
        assert_ne!(conflict.next_free, Some(port));
    }

    #[test]
    fn test_free_port_passes() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(check_port(port).is_none());
    }
}
