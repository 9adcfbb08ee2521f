//! The source-plugin capability set
//!
//! One install strategy per implementation. Plugins are trusted,
//! statically registered code; every method is a pure function of
//! `(installation, args, context)` — no per-installation plugin state.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crucible_core::types::{
    ActionData, ActionDescriptor, ActionResult, DetailSection, FieldDescriptor, FieldOption,
    Installation, InstallationPatch, LaunchCommand,
};
use crucible_core::Error;

use crate::context::InstallContext;

/// One install strategy
#[async_trait]
pub trait SourcePlugin: std::fmt::Debug + Send + Sync {
    /// Stable plugin identifier, stored as the record's `source_id`
    fn id(&self) -> &'static str;

    /// Human-readable strategy name
    fn label(&self) -> &'static str;

    /// Declarative "new install" form fields
    fn fields(&self) -> Vec<FieldDescriptor>;

    /// Resolve the options of a select field, possibly chained through
    /// earlier selections
    ///
    /// `installation` is None when resolving a "new install" form field and
    /// Some when resolving a select step of an action chain.
    async fn resolve_options(
        &self,
        _field: &str,
        _installation: Option<&Installation>,
        _selections: &HashMap<String, String>,
        _ctx: &InstallContext,
    ) -> Result<Vec<FieldOption>> {
        Ok(Vec::new())
    }

    /// Validate selections and build the record fragment to persist
    fn build_installation(&self, selections: &HashMap<String, String>)
        -> Result<InstallationPatch>;

    /// Resolved launch command; None means "not ready", not an error
    fn launch_command(&self, installation: &Installation) -> Option<LaunchCommand>;

    /// Perform the install into the record's `install_path`
    async fn install(&self, installation: &Installation, ctx: &InstallContext) -> Result<()>;

    /// Hook run by the engine after a successful install
    async fn post_install(
        &self,
        _installation: &Installation,
        _ctx: &InstallContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Detect an existing installation in a directory
    fn probe(&self, _dir: &Path) -> Option<InstallationPatch> {
        None
    }

    /// Declarative list actions for this installation's current state
    fn list_actions(&self, _installation: &Installation) -> Vec<ActionDescriptor> {
        Vec::new()
    }

    /// Declarative detail-view sections
    fn detail_sections(&self, _installation: &Installation) -> Vec<DetailSection> {
        Vec::new()
    }

    /// Service one of this plugin's declared actions
    async fn handle_action(
        &self,
        action_id: &str,
        installation: &Installation,
        data: &ActionData,
        ctx: &InstallContext,
    ) -> Result<ActionResult>;
}

/// Fetch a required selection value
pub(crate) fn required<'a>(
    selections: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str> {
    selections
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!(Error::missing_field(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_rejects_missing_and_blank() {
        let mut selections = HashMap::new();
        selections.insert("name".to_string(), "  ".to_string());

        assert!(required(&selections, "name").is_err());
        assert!(required(&selections, "absent").is_err());

        selections.insert("release".to_string(), "v1.2.0".to_string());
        assert_eq!(required(&selections, "release").unwrap(), "v1.2.0");
    }
}
