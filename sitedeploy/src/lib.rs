//! # Sitedeploy
//!
//! A git-triggered deployment pipeline for statically generated sites.
//!
//! Every push to a tracked branch becomes a run that moves through two
//! stages:
//!
//! - **Generate**: fetch the commit and render it with a site generator
//! - **Sync**: upload the rendered tree to a content store with per-type
//!   cache headers
//!
//! Runs on the same branch never overlap, and a newer push supersedes older
//! unfinished runs. Every stage output is kept as an immutable, content
//! hashed artifact, and repository activity is fanned out to notification
//! subscribers independently of pipeline outcome.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sitedeploy::prelude::*;
//!
//! let notifier = Arc::new(Notifier::new());
//! let (watcher, triggers) = SourceWatcher::new(&config.watch, notifier.clone())?;
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::from(&config),
//!     generate,
//!     sync,
//!     artifacts,
//!     notifier,
//! );
//! orchestrator.spawn_intake(triggers);
//!
//! watcher.on_change("main", "abc123", now_utc())?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{DeployConfig, RetentionConfig, WatchConfig};
    pub use crate::core::{
        ActivityEvent, Artifact, ArtifactContent, ArtifactId, ArtifactRef, Run, RunId, RunState,
        SourceRef, StageKind, TriggerEvent,
    };
    pub use crate::errors::{DeployError, StageError, StageErrorKind, StoreError};
    pub use crate::notify::{LoggingSubscriber, Notifier, Subscriber};
    pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, SubmitOutcome};
    pub use crate::stages::{
        CommandGenerateStage, ContentSyncStage, GitSourceRepository, Stage, StageContext, StagePolicy,
    };
    pub use crate::store::{ArtifactStore, ContentStore, DirectoryContentStore, FsArtifactStore};
    pub use crate::utils::{now_utc, Timestamp};
    pub use crate::watcher::{SourceWatcher, WatchOutcome};
    pub use std::sync::Arc;
}
