//! Template manifests: trees of templated files and directories.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::FlagPredicate;
use crate::errors::TemplateError;

/// One node of a manifest tree.
///
/// A node with `children` is a directory; its predicate gates the whole
/// subtree. Any other node is a file and must carry `content`. Both `path`
/// and `content` are handlebars templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Path segment(s) relative to the parent directory.
    pub path: String,
    /// File content template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Inclusion predicate.
    #[serde(default)]
    pub when: FlagPredicate,
    /// Child nodes of a directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ManifestNode>,
}

impl ManifestNode {
    /// Creates a file node included unconditionally.
    #[must_use]
    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            when: FlagPredicate::Always,
            children: Vec::new(),
        }
    }

    /// Creates a directory node.
    #[must_use]
    pub fn dir(path: impl Into<String>, children: Vec<ManifestNode>) -> Self {
        Self {
            path: path.into(),
            content: None,
            when: FlagPredicate::Always,
            children,
        }
    }

    /// Sets the inclusion predicate.
    #[must_use]
    pub fn when(mut self, predicate: FlagPredicate) -> Self {
        self.when = predicate;
        self
    }

    /// Returns true for directory nodes.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        !self.children.is_empty()
    }
}

/// A named template: a flag vocabulary and a node tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateManifest {
    /// Template id referenced by service specs.
    pub template_id: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Declared feature flags.
    #[serde(default)]
    pub flags: BTreeSet<String>,
    /// Top-level nodes.
    pub nodes: Vec<ManifestNode>,
}

impl TemplateManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            description: String::new(),
            flags: BTreeSet::new(),
            nodes: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declares feature flags.
    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Appends a top-level node.
    #[must_use]
    pub fn with_node(mut self, node: ManifestNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Parses and validates a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| TemplateError::malformed(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Declared flags plus every flag a predicate mentions.
    #[must_use]
    pub fn known_flags(&self) -> BTreeSet<String> {
        let mut flags = self.flags.clone();
        let mut stack: Vec<&ManifestNode> = self.nodes.iter().collect();
        while let Some(node) = stack.pop() {
            node.when.collect_flags(&mut flags);
            stack.extend(node.children.iter());
        }
        flags
    }

    /// Checks the tree shape and every raw path.
    ///
    /// Paths that contain template expressions are checked again after
    /// rendering.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.template_id.trim().is_empty() {
            return Err(TemplateError::malformed("template_id must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(TemplateError::malformed(format!(
                "template '{}' has no nodes",
                self.template_id
            )));
        }

        let mut seen = BTreeSet::new();
        validate_nodes(&self.nodes, "", &mut seen)
    }
}

fn validate_nodes(
    nodes: &[ManifestNode],
    parent: &str,
    seen: &mut BTreeSet<String>,
) -> Result<(), TemplateError> {
    for node in nodes {
        check_path(&node.path)?;
        let full = join_path(parent, &node.path);

        if node.is_dir() {
            if node.content.is_some() {
                return Err(TemplateError::malformed(format!(
                    "'{full}' has both content and children"
                )));
            }
            validate_nodes(&node.children, &full, seen)?;
        } else {
            if node.content.is_none() {
                return Err(TemplateError::malformed(format!("file '{full}' has no content")));
            }
            // Only literal paths can be compared before rendering.
            if !full.contains("{{") && !seen.insert(full.clone()) {
                return Err(TemplateError::malformed(format!("duplicate path '{full}'")));
            }
        }
    }
    Ok(())
}

/// Rejects empty, absolute and parent-relative paths.
pub(crate) fn check_path(path: &str) -> Result<(), TemplateError> {
    if path.trim().is_empty() {
        return Err(TemplateError::malformed("empty path"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(TemplateError::malformed(format!("absolute path '{path}'")));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(TemplateError::malformed(format!("empty segment in '{path}'")));
        }
        if segment == ".." || segment == "." {
            return Err(TemplateError::malformed(format!("relative segment in '{path}'")));
        }
    }
    Ok(())
}

pub(crate) fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}
