//! Rendered file trees and the references that point at them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque reference to a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Wraps an existing reference string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Content-addressed reference for a generated tree.
    #[must_use]
    pub fn for_tree(service_name: &str, checksum: &str) -> Self {
        let digest = checksum.strip_prefix("sha256:").unwrap_or(checksum);
        Self(format!("workspace://{service_name}/{digest}"))
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of files keyed by relative path, always iterated in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    #[serde(with = "base64_files")]
    files: BTreeMap<String, Vec<u8>>,
}

impl FileTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a file, returning the previous contents if the path existed.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.files.insert(path.into(), contents.into())
    }

    /// Returns the contents of a file.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Returns true if the tree has a file at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Iterates over `(path, contents)` in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
    }

    /// Returns all paths in order.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the tree has no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all file contents in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Content checksum over every path and its bytes, in path order.
    ///
    /// Lengths are mixed in so that moving bytes between a path and its
    /// contents cannot produce the same digest.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, bytes) in &self.files {
            hasher.update((path.len() as u64).to_be_bytes());
            hasher.update(path.as_bytes());
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

impl FromIterator<(String, Vec<u8>)> for FileTree {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// The output of the template composition engine.
///
/// Immutable once produced and identified by its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedArtifact {
    /// The service the tree was rendered for.
    pub service_name: String,
    /// The template it was rendered from.
    pub template_id: String,
    /// The rendered files.
    pub files: FileTree,
    /// Checksum of `files`.
    pub checksum: String,
}

impl RenderedArtifact {
    /// Wraps a rendered tree, computing its checksum.
    #[must_use]
    pub fn new(service_name: impl Into<String>, template_id: impl Into<String>, files: FileTree) -> Self {
        let checksum = files.checksum();
        Self {
            service_name: service_name.into(),
            template_id: template_id.into(),
            files,
            checksum,
        }
    }

    /// The content-addressed reference for this artifact.
    #[must_use]
    pub fn artifact_ref(&self) -> ArtifactRef {
        ArtifactRef::for_tree(&self.service_name, &self.checksum)
    }
}

mod base64_files {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(files: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(files.iter().map(|(path, bytes)| (path, STANDARD.encode(bytes))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(path, data)| {
                STANDARD
                    .decode(data)
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("src/main.rs", "fn main() {}");
        tree.insert("README.md", "# demo");
        tree
    }

    #[test]
    fn test_tree_iterates_in_path_order() {
        let tree = sample_tree();
        assert_eq!(tree.paths(), vec!["README.md", "src/main.rs"]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get("README.md"), Some(b"# demo".as_slice()));
    }

    #[test]
    fn test_checksum_is_insertion_order_independent() {
        let mut reversed = FileTree::new();
        reversed.insert("README.md", "# demo");
        reversed.insert("src/main.rs", "fn main() {}");

        assert_eq!(sample_tree().checksum(), reversed.checksum());
    }

    #[test]
    fn test_checksum_detects_content_and_path_changes() {
        let base = sample_tree().checksum();

        let mut changed = sample_tree();
        changed.insert("README.md", "# demo!");
        assert_ne!(base, changed.checksum());

        let mut shifted = FileTree::new();
        shifted.insert("a", "bc");
        let mut other = FileTree::new();
        other.insert("ab", "c");
        assert_ne!(shifted.checksum(), other.checksum());
    }

    #[test]
    fn test_artifact_ref_for_tree() {
        let artifact = RenderedArtifact::new("foo-api", "rest-api", sample_tree());
        let reference = artifact.artifact_ref();

        assert!(artifact.checksum.starts_with("sha256:"));
        assert!(reference.as_str().starts_with("workspace://foo-api/"));
        assert!(!reference.as_str().contains("sha256:"));
    }

    #[test]
    fn test_tree_serialization_uses_base64() {
        let tree = sample_tree();
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["files"]["README.md"], "IyBkZW1v");

        let back: FileTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }
}
