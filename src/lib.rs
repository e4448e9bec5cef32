//! Karma Explorer - Angular test explorer adapter
//!
//! Connects a test explorer UI to Angular projects tested with Karma:
//! - Project discovery from `angular.json` / `.angular-cli.json`
//! - A warm Karma server per project, restarted on reload
//! - Hierarchical test tree built from reporter specs
//! - Run requests correlated to their completion events
//! - Watch mode reloading tests when spec files change

pub mod config;
pub mod detector;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod project;
pub mod server;
pub mod test_model;
pub mod test_runner;
pub mod tree_builder;
pub mod watcher;

pub use config::ExplorerConfig;
pub use detector::{AngularCliDetector, ProjectTypeDetector};
pub use error::{ExplorerError, Result};
pub use listener::{KarmaEventListener, RunCompletionListener, TestLoadListener};
pub use orchestrator::{plan_load, Collaborators, LifecycleCommand, Orchestrator, ProjectState};
pub use project::{AngularProjectConfigLoader, Project, ProjectConfigLoader};
pub use server::{KarmaServer, KarmaServerFactory, ServerFactory, ServerRegistry, TestServerLifecycle};
pub use test_model::{RawTestRecord, RunCompletionSnapshot, RunId, RunResult, RunStatus, TestNode, TestTree};
pub use test_runner::{KarmaRunner, TestRunner};
pub use tree_builder::TestTreeBuilder;
pub use watcher::SpecWatcher;
