//! Test explorer orchestration
//!
//! Every load classifies the project into a [`ProjectState`] and applies the
//! lifecycle commands from [`plan_load`] before asking the runner for specs.
//! Runs are correlated to their completion through a [`RunId`], falling back
//! to the latest completion when the reporter does not echo the id.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::detector::ProjectTypeDetector;
use crate::error::{ExplorerError, Result};
use crate::listener::RunCompletionListener;
use crate::project::{Project, ProjectConfigLoader};
use crate::server::ServerRegistry;
use crate::test_model::{RunCompletionSnapshot, RunId, TestTree};
use crate::test_runner::TestRunner;
use crate::tree_builder::TestTreeBuilder;

/// Where a project stands when a load is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    NotRunnable,
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Stop,
    Start,
}

/// Lifecycle commands a load issues, in order
///
/// A running server is restarted because Karma cannot refresh in place.
pub fn plan_load(state: ProjectState) -> &'static [LifecycleCommand] {
    match state {
        ProjectState::NotRunnable => &[],
        ProjectState::Idle => &[LifecycleCommand::Start],
        ProjectState::Running => &[LifecycleCommand::Stop, LifecycleCommand::Start],
    }
}

/// Collaborators an [`Orchestrator`] is assembled from
pub struct Collaborators {
    pub detector: Arc<dyn ProjectTypeDetector>,
    pub config_loader: Arc<dyn ProjectConfigLoader>,
    pub servers: ServerRegistry,
    pub runner: Arc<dyn TestRunner>,
    pub completions: Arc<RunCompletionListener>,
    pub tree_builder: TestTreeBuilder,
}

#[derive(Default)]
struct ExplorerState {
    projects: Option<Vec<Project>>,
    active_project: Option<String>,
}

pub struct Orchestrator {
    detector: Arc<dyn ProjectTypeDetector>,
    config_loader: Arc<dyn ProjectConfigLoader>,
    servers: ServerRegistry,
    runner: Arc<dyn TestRunner>,
    completions: Arc<RunCompletionListener>,
    tree_builder: TestTreeBuilder,
    run_settle: Duration,
    state: RwLock<ExplorerState>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators) -> Self {
        let Collaborators {
            detector,
            config_loader,
            servers,
            runner,
            completions,
            tree_builder,
        } = collaborators;

        Self {
            detector,
            config_loader,
            servers,
            runner,
            completions,
            tree_builder,
            run_settle: Duration::from_millis(2_000),
            state: RwLock::new(ExplorerState::default()),
        }
    }

    /// How long a run waits for its own completion before using the latest one
    pub fn with_run_settle(mut self, run_settle: Duration) -> Self {
        self.run_settle = run_settle;
        self
    }

    pub async fn load_projects_configuration(&self) -> Result<Vec<Project>> {
        let projects = self.config_loader.get_all_projects()?;
        self.state.write().await.projects = Some(projects.clone());
        Ok(projects)
    }

    pub async fn active_project(&self) -> Option<String> {
        self.state.read().await.active_project.clone()
    }

    async fn resolve_project(&self, project_name: &str) -> Result<Project> {
        let cached = self.state.read().await.projects.clone();
        let projects = match cached {
            Some(projects) => projects,
            None => self.load_projects_configuration().await?,
        };

        projects
            .into_iter()
            .find(|p| p.name == project_name)
            .ok_or_else(|| ExplorerError::UnknownProject(project_name.to_string()))
    }

    fn classify(&self, project: &Project) -> Result<ProjectState> {
        if !self.detector.is_runnable_project(&project.root_path)? {
            return Ok(ProjectState::NotRunnable);
        }

        if self.servers.handle(project).is_running() {
            Ok(ProjectState::Running)
        } else {
            Ok(ProjectState::Idle)
        }
    }

    pub async fn load_tests(&self, project_name: &str, timeout_ms: u64) -> Result<TestTree> {
        let project = self.resolve_project(project_name).await?;
        let state = self.classify(&project)?;
        tracing::info!(project = %project.name, state = ?state, "loading tests");

        if state == ProjectState::NotRunnable {
            return Ok(TestTree::empty());
        }

        let server = self.servers.handle(&project);
        for command in plan_load(state) {
            tracing::debug!(project = %project.name, command = ?command, "server lifecycle");
            match command {
                LifecycleCommand::Stop => server.stop().await?,
                LifecycleCommand::Start => server.start().await?,
            }
        }

        let records = self
            .runner
            .load_tests(server.port(), Duration::from_millis(timeout_ms))
            .await?;
        let tree = self.tree_builder.build(&records);

        self.state.write().await.active_project = Some(project.name.clone());
        tracing::info!(project = %project.name, tests = tree.test_count(), "tests loaded");

        Ok(tree)
    }

    /// Run the given tests on the active project's server, or all tests when
    /// `test_ids` is empty
    pub async fn run_tests(&self, test_ids: Vec<String>) -> Result<Option<RunCompletionSnapshot>> {
        let run_id = RunId::new();
        let port = self.active_port().await;
        tracing::info!(%run_id, port = ?port, tests = test_ids.len(), "running tests");

        self.runner.run_tests(port, &test_ids, &run_id).await?;

        if let Some(snapshot) = self.completions.wait_for(&run_id, self.run_settle).await {
            return Ok(Some(snapshot));
        }

        let latest = self.completions.latest();
        match latest.as_ref().and_then(|snapshot| snapshot.run_id) {
            Some(other) => tracing::warn!(%run_id, %other, "no completion for this run, latest belongs to another run"),
            None => tracing::debug!(%run_id, "no correlated completion, using latest"),
        }
        Ok(latest)
    }

    pub async fn debug_tests(&self, _test_ids: Vec<String>) -> Result<()> {
        Err(ExplorerError::NotImplemented)
    }

    /// Stop every test server started by this explorer
    pub async fn shutdown(&self) -> Result<()> {
        self.servers.shutdown_all().await
    }

    /// Root of the project currently loaded, used by the watcher
    pub async fn active_root(&self) -> Option<PathBuf> {
        let project = self.active().await?;
        Some(project.root_path)
    }

    async fn active(&self) -> Option<Project> {
        let state = self.state.read().await;
        let active = state.active_project.as_deref()?;
        let project = state.projects.iter().flatten().find(|p| p.name == active).cloned();
        project
    }

    async fn active_port(&self) -> Option<u16> {
        let project = self.active().await?;
        Some(self.servers.handle(&project).port())
    }
}
