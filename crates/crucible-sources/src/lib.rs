//! Source plugins for Crucible
//!
//! An installation is acquired through one of five statically registered
//! strategies: a prebuilt standalone bundle, a portable single archive, a
//! git checkout, a remote endpoint, or the hosted cloud. Each strategy
//! implements the same capability set; the engine dispatches to it through
//! the registry and never inspects strategy internals.

pub mod cloud;
pub mod context;
pub mod git;
pub mod plugin;
pub mod portable;
pub mod registry;
pub mod remote;
pub mod standalone;

pub use context::InstallContext;
pub use plugin::SourcePlugin;
pub use registry::SourceRegistry;
