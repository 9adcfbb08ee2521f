//! Action-chain evaluation
//!
//! A descriptor's steps run in a fixed order: confirm → selects → prompt.
//! Each step either continues with accumulated data or cancels; a cancel
//! at any step aborts the whole chain before any side effect.

use async_trait::async_trait;

use anyhow::Result;

use crucible_core::types::{
    ActionData, ActionDescriptor, ConfirmSpec, FieldOption, Installation, PromptSpec, SelectSpec,
};
use crucible_sources::{InstallContext, SourcePlugin};

/// Outcome of evaluating a chain
#[derive(Debug)]
pub enum ChainOutcome {
    /// Every step completed; dispatch with this data
    Continue(ActionData),
    /// The user backed out; nothing was touched
    Cancelled,
}

/// UI adapter answering the chain's questions
///
/// `None` from any method means the user cancelled that step.
#[async_trait]
pub trait ChainPrompter: Send + Sync {
    /// Present a confirmation; returns the ticked checkbox options
    async fn confirm(&self, spec: &ConfirmSpec) -> Option<Vec<String>>;

    /// Present a selection over the resolved options
    async fn select(&self, spec: &SelectSpec, options: &[FieldOption]) -> Option<String>;

    /// Present a free-text prompt
    async fn prompt(&self, spec: &PromptSpec) -> Option<String>;
}

/// Evaluate a descriptor's chain against a prompter
pub async fn run_chain(
    descriptor: &ActionDescriptor,
    plugin: &dyn SourcePlugin,
    installation: &Installation,
    prompter: &dyn ChainPrompter,
    ctx: &InstallContext,
) -> Result<ChainOutcome> {
    let mut data = ActionData::default();

    if let Some(confirm) = &descriptor.confirm {
        match prompter.confirm(confirm).await {
            Some(ticked) => data.confirmed_options = ticked,
            None => return Ok(ChainOutcome::Cancelled),
        }
    }

    for spec in &descriptor.selects {
        let options = if !spec.options.is_empty() {
            spec.options.clone()
        } else if let Some(field) = &spec.field {
            plugin
                .resolve_options(field, Some(installation), &data.selections, ctx)
                .await?
        } else {
            Vec::new()
        };

        match prompter.select(spec, &options).await {
            Some(value) => {
                data.selections.insert(spec.id.clone(), value);
            }
            None => return Ok(ChainOutcome::Cancelled),
        }
    }

    if let Some(prompt) = &descriptor.prompt {
        match prompter.prompt(prompt).await {
            Some(value) => {
                if prompt.required && value.trim().is_empty() {
                    return Ok(ChainOutcome::Cancelled);
                }
                if !value.trim().is_empty() {
                    data.prompt_value = Some(value);
                }
            }
            None => return Ok(ChainOutcome::Cancelled),
        }
    }

    Ok(ChainOutcome::Continue(data))
}

/// Prompter that accepts every step with its defaults
///
/// Confirms without ticking options, takes the first select option, and
/// leaves prompts empty. Suitable for automation and tests.
pub struct ApproveAll;

#[async_trait]
impl ChainPrompter for ApproveAll {
    async fn confirm(&self, _spec: &ConfirmSpec) -> Option<Vec<String>> {
        Some(Vec::new())
    }

    async fn select(&self, _spec: &SelectSpec, options: &[FieldOption]) -> Option<String> {
        options.first().map(|o| o.value.clone())
    }

    async fn prompt(&self, _spec: &PromptSpec) -> Option<String> {
        Some(String::new())
    }
}

/// Prompter that cancels at the first question
pub struct DeclineAll;

#[async_trait]
impl ChainPrompter for DeclineAll {
    async fn confirm(&self, _spec: &ConfirmSpec) -> Option<Vec<String>> {
        None
    }

    async fn select(&self, _spec: &SelectSpec, _options: &[FieldOption]) -> Option<String> {
        None
    }

    async fn prompt(&self, _spec: &PromptSpec) -> Option<String> {
        None
    }
}
