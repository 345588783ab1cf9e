//! Core domain types: stages, statuses, service requests, jobs and artifacts.

mod artifact;
mod job;
mod service;
mod status;

pub use artifact::{ArtifactRef, FileTree, RenderedArtifact};
pub use job::{JobId, JobRecord, JobStatusView, StageRecord};
pub use service::{validate_service_name, ServiceSpec, MAX_NAME_LEN, MIN_NAME_LEN};
pub use status::{JobStatus, PipelineOutcome, Stage};
