//! Static plugin registry
//!
//! Built once at startup from the closed set of variants; read-only at
//! runtime. Lookup by id is the only operation, and an unknown id is fatal
//! to the request, never to the process.

use std::sync::Arc;

use crucible_core::{Error, Result};

use crate::cloud::CloudSource;
use crate::git::GitSource;
use crate::plugin::SourcePlugin;
use crate::portable::PortableSource;
use crate::remote::RemoteSource;
use crate::standalone::StandaloneSource;

/// The closed set of install strategies
pub struct SourceRegistry {
    plugins: Vec<Arc<dyn SourcePlugin>>,
}

impl SourceRegistry {
    /// Registry over all five variants
    pub fn new() -> Self {
        Self {
            plugins: vec![
                Arc::new(StandaloneSource),
                Arc::new(PortableSource),
                Arc::new(GitSource),
                Arc::new(RemoteSource),
                Arc::new(CloudSource),
            ],
        }
    }

    /// Look up a plugin by id
    pub fn get(&self, id: &str) -> Result<Arc<dyn SourcePlugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.id() == id)
            .cloned()
            .ok_or_else(|| Error::unknown_source(id))
    }

    /// All registered plugins, in registration order
    pub fn all(&self) -> &[Arc<dyn SourcePlugin>] {
        &self.plugins
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_five_variants_are_registered() {
        let registry = SourceRegistry::new();
        let ids: Vec<&str> = registry.all().iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec!["standalone", "portable", "git", "remote", "cloud"]
        );
    }

    #[test]
    fn test_unknown_id_is_a_request_error() {
        let registry = SourceRegistry::new();
        let err = registry.get("floppy").unwrap_err();
        assert!(matches!(err, Error::UnknownSource { .. }));
    }

    #[test]
    fn test_lookup_by_id() {
        let registry = SourceRegistry::new();
        assert_eq!(registry.get("git").unwrap().id(), "git");
    }
}
