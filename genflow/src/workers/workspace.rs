//! Filesystem workspace.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{TeardownCapability, WorkspaceWriter};
use crate::core::{validate_service_name, ArtifactRef, FileTree, ServiceSpec, Stage};
use crate::errors::{PipelineError, Result, ValidationError};

const CHECKSUM_MARKER: &str = ".genflow-checksum";
const SCHEME: &str = "workspace://";

/// Stores trees under `<root>/<service>/<digest>/`.
///
/// The checksum marker is written last, so a directory without one is an
/// interrupted write and is rewritten. Teardown removes the directory;
/// removing a missing directory succeeds.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    /// Creates a workspace rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, service_name: &str, digest: &str) -> PathBuf {
        self.root.join(service_name).join(digest)
    }

    fn resolve(&self, artifact_ref: &ArtifactRef) -> Result<PathBuf> {
        let invalid = || ValidationError::new("artifact_ref", format!("not a workspace reference: {artifact_ref}"));
        let rest = artifact_ref.as_str().strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (service_name, digest) = rest.split_once('/').ok_or_else(invalid)?;
        validate_service_name(service_name)?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid().into());
        }
        Ok(self.artifact_dir(service_name, digest))
    }

    async fn collect(dir: &Path, prefix: &str, tree: &mut FileTree) -> Result<()> {
        let mut pending = vec![(dir.to_path_buf(), prefix.to_string())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), path));
                } else if path != CHECKSUM_MARKER {
                    tree.insert(path, tokio::fs::read(entry.path()).await?);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceWriter for FsWorkspace {
    async fn write(&self, service_name: &str, tree: &FileTree) -> Result<ArtifactRef> {
        validate_service_name(service_name)?;
        let checksum = tree.checksum();
        let artifact_ref = ArtifactRef::for_tree(service_name, &checksum);
        let dir = self.resolve(&artifact_ref)?;

        for (path, bytes) in tree.iter() {
            let target = path.split('/').fold(dir.clone(), |acc, segment| acc.join(segment));
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(CHECKSUM_MARKER), checksum.as_bytes()).await?;

        tracing::debug!(service = service_name, path = %dir.display(), files = tree.len(), "Wrote workspace");
        Ok(artifact_ref)
    }

    async fn read(&self, artifact_ref: &ArtifactRef) -> Result<FileTree> {
        let dir = self.resolve(artifact_ref)?;
        let mut tree = FileTree::new();
        Self::collect(&dir, "", &mut tree).await?;
        Ok(tree)
    }

    async fn find(&self, service_name: &str, checksum: &str) -> Result<Option<ArtifactRef>> {
        let artifact_ref = ArtifactRef::for_tree(service_name, checksum);
        let dir = self.resolve(&artifact_ref)?;
        match tokio::fs::read_to_string(dir.join(CHECKSUM_MARKER)).await {
            Ok(stored) if stored == checksum => Ok(Some(artifact_ref)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_path(&self, artifact_ref: &ArtifactRef) -> Option<PathBuf> {
        self.resolve(artifact_ref).ok()
    }
}

#[async_trait]
impl TeardownCapability for FsWorkspace {
    async fn teardown(
        &self,
        spec: &ServiceSpec,
        artifact: Option<&ArtifactRef>,
        stage_reached: Stage,
    ) -> Result<()> {
        let Some(artifact) = artifact else {
            tracing::debug!(service = %spec.name, %stage_reached, "Nothing to tear down");
            return Ok(());
        };

        let dir = self.resolve(artifact)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(service = %spec.name, %stage_reached, path = %dir.display(), "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::Io(e)),
        }
    }
}
