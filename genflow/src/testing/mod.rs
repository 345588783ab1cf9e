//! Testing utilities for genflow pipelines.
//!
//! This module provides:
//! - In-memory and scripted workspaces and capabilities
//! - Config fixtures and a coordinator test harness

pub mod fixtures;
mod mocks;

pub use fixtures::{fast_config, service_spec, wait_until, TestHarness, TestHarnessBuilder};
pub use mocks::{
    BlockingCapability, FlakyWorkspace, GatedWorkspace, InMemoryWorkspace, RecordingTeardown,
    ScriptedCapability, TeardownCall,
};
