//! Hosted cloud strategy
//!
//! Like the remote variant but against the fixed hosted endpoint, with an
//! isolated browser partition per installation so sessions don't bleed
//! between records.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crucible_core::types::{
    ActionData, ActionResult, DetailSection, FieldDescriptor, FieldKind, Installation,
    InstallationPatch, LaunchCommand,
};

use crate::context::InstallContext;
use crate::plugin::{required, SourcePlugin};

pub const SOURCE_ID: &str = "cloud";

/// The hosted endpoint every cloud installation points at
pub const CLOUD_ENDPOINT: &str = "https://cloud.crucible.app";

#[derive(Debug)]
pub struct CloudSource;

#[async_trait]
impl SourcePlugin for CloudSource {
    fn id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label(&self) -> &'static str {
        "Cloud"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![FieldDescriptor {
            id: "name".to_string(),
            label: "Name".to_string(),
            kind: FieldKind::Text,
            required: true,
            depends_on: None,
        }]
    }

    fn build_installation(
        &self,
        selections: &HashMap<String, String>,
    ) -> Result<InstallationPatch> {
        let name = required(selections, "name")?;

        let mut patch = InstallationPatch {
            name: Some(name.to_string()),
            source_id: Some(SOURCE_ID.to_string()),
            install_path: Some(std::path::PathBuf::new()),
            browser_partition: Some(format!(
                "persist:cloud-{}",
                name.to_ascii_lowercase().replace(' ', "-")
            )),
            ..Default::default()
        };
        patch
            .extra
            .insert("url".to_string(), serde_json::json!(CLOUD_ENDPOINT));
        Ok(patch)
    }

    fn launch_command(&self, _installation: &Installation) -> Option<LaunchCommand> {
        None
    }

    async fn install(&self, _installation: &Installation, _ctx: &InstallContext) -> Result<()> {
        Ok(())
    }

    fn detail_sections(&self, installation: &Installation) -> Vec<DetailSection> {
        vec![DetailSection {
            title: "Cloud".to_string(),
            rows: vec![
                ("Endpoint".to_string(), CLOUD_ENDPOINT.to_string()),
                (
                    "Browser partition".to_string(),
                    installation
                        .browser_partition
                        .clone()
                        .unwrap_or_else(|| "—".to_string()),
                ),
            ],
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
    fn test_build_installation_assigns_browser_partition() {
        let mut selections = HashMap::new();
        selections.insert("name".to_string(), "My Cloud".to_string());

        let patch = CloudSource.build_installation(&selections).unwrap();
        assert_eq!(
            patch.browser_partition.as_deref(),
            Some("persist:cloud-my-cloud")
        );
        assert_eq!(
            patch.extra.get("url").and_then(|v| v.as_str()),
            Some(CLOUD_ENDPOINT)
        );
    }
}
