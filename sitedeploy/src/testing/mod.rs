//! Testing utilities for deployment pipelines.
//!
//! This module provides:
//! - Scripted and gated stages with call recording
//! - Fixtures for sources, triggers and site trees
//! - A fully in-memory pipeline harness

mod fixtures;
mod mocks;

pub use fixtures::{render_output, sample_site, source, trigger, TestPipeline};
pub use mocks::{GateStage, ScriptedStage, StageCall};
