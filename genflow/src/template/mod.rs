//! Template composition.
//!
//! A [`TemplateManifest`] is a tree of templated files, each gated by a
//! [`FlagPredicate`] over the request's feature flags. The
//! [`TemplateEngine`] walks the tree, renders every included node and
//! returns a checksummed [`RenderedArtifact`](crate::core::RenderedArtifact).
//! Rendering does no I/O.

mod catalog;
mod engine;
mod manifest;
mod predicate;

pub use catalog::TemplateCatalog;
pub use engine::TemplateEngine;
pub use manifest::{ManifestNode, TemplateManifest};
pub use predicate::FlagPredicate;
