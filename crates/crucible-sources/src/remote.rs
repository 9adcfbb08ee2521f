//! Remote endpoint strategy
//!
//! No local files at all; the record stores a URL the UI opens in its own
//! surface. Launch is never available, and the only mutations are the
//! engine-generic edit/remove paths.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crucible_core::types::{
    ActionData, ActionResult, DetailSection, FieldDescriptor, FieldKind, Installation,
    InstallationPatch, LaunchCommand,
};
use crucible_core::Error;

use crate::context::InstallContext;
use crate::plugin::{required, SourcePlugin};

pub const SOURCE_ID: &str = "remote";

#[derive(Debug)]
pub struct RemoteSource;

impl RemoteSource {
    pub(crate) fn url(installation: &Installation) -> Option<String> {
        installation
            .extra
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl SourcePlugin for RemoteSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label(&self) -> &'static str {
        "Remote endpoint"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor {
                id: "name".to_string(),
                label: "Name".to_string(),
                kind: FieldKind::Text,
                required: true,
                depends_on: None,
            },
            FieldDescriptor {
                id: "url".to_string(),
                label: "Endpoint URL".to_string(),
                kind: FieldKind::Text,
                required: true,
                depends_on: None,
            },
        ]
    }

    fn build_installation(
        &self,
        selections: &HashMap<String, String>,
    ) -> Result<InstallationPatch> {
        let name = required(selections, "name")?;
        let url = required(selections, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!(Error::missing_field("url (must be http or https)")));
        }

        let mut patch = InstallationPatch {
            name: Some(name.to_string()),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(std::path::PathBuf::new()),
            ..Default::default()
        };
        patch.extra.insert("url".to_string(), serde_json::json!(url));
        Ok(patch)
    }

    /// Remote endpoints are opened in a browser surface, never launched
    fn launch_command(&self, _installation: &Installation) -> Option<LaunchCommand> {
        None
    }

    async fn install(&self, _installation: &Installation, _ctx: &InstallContext) -> Result<()> {
        // Nothing lands on disk
        Ok(())
    }

    fn detail_sections(&self, installation: &Installation) -> Vec<DetailSection> {
        vec![DetailSection {
            title: "Endpoint".to_string(),
            rows: vec![(
                "URL".to_string(),
                Self::url(installation).unwrap_or_else(|| "—".to_string()),
            )],
        }]
    }

    async fn handle_action(
        &self,
        action_id: &str,
        _installation: &Installation,
        _data: &ActionData,
        _ctx: &InstallContext,
    ) -> Result<ActionResult> {
        Ok(ActionResult::failed(format!(
            "Unknown action: {}",
            action_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_installation_requires_http_url() {
        let mut selections = HashMap::new();
        selections.insert("name".to_string(), "Server".to_string());
        selections.insert("url".to_string(), "ftp://example.com".to_string());
        assert!(RemoteSource.build_installation(&selections).is_err());

        selections.insert("url".to_string(), "https://example.com:8188".to_string());
        let patch = RemoteSource.build_installation(&selections).unwrap();
        assert_eq!(
            patch.extra.get("url").and_then(|v| v.as_str()),
            Some("https://example.com:8188")
        );
    }
}
