//! Test runner module
//!
//! Drives a running Karma server through the `karma run` client. Loading
//! and running both trigger a browser run; results come back through the
//! reporter events rather than the client's output.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::RunnerSection;
use crate::error::{ExplorerError, Result};
use crate::listener::TestLoadListener;
use crate::test_model::{RawTestRecord, RunId};

/// Client arg telling the reporter to list specs instead of executing them
pub const LOAD_FLAG: &str = "--karma-explorer-load";
pub const RUN_ID_FLAG: &str = "--karma-explorer-run-id";

const NO_SERVER_MARKER: &str = "There is no server listening";

/// Drives the test server listening on `port`
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Fails with [`ExplorerError::Timeout`] when no specs arrive within `timeout`
    async fn load_tests(&self, port: u16, timeout: Duration) -> Result<Vec<RawTestRecord>>;

    /// Resolves once the run has been carried out. An empty `test_ids` runs
    /// everything, and `None` targets the runner's default server.
    async fn run_tests(&self, port: Option<u16>, test_ids: &[String], run_id: &RunId) -> Result<()>;
}

/// Build a jasmine `--grep` pattern matching exactly the given full names
pub fn grep_pattern(test_ids: &[String]) -> Option<String> {
    if test_ids.is_empty() {
        return None;
    }

    let alternatives: Vec<String> = test_ids.iter().map(|id| regex::escape(id)).collect();
    Some(format!("^({})$", alternatives.join("|")))
}

pub struct KarmaRunner {
    settings: RunnerSection,
    default_port: u16,
    workspace_root: PathBuf,
    loads: Arc<TestLoadListener>,
}

impl KarmaRunner {
    pub fn new(settings: RunnerSection, default_port: u16, workspace_root: &Path, loads: Arc<TestLoadListener>) -> Self {
        Self {
            settings,
            default_port,
            workspace_root: workspace_root.to_path_buf(),
            loads,
        }
    }

    /// Full `karma run` argument list for the given client args
    pub fn client_args(&self, port: u16, client_args: &[String]) -> Vec<String> {
        let mut args = self.settings.args.clone();
        args.push("--port".to_string());
        args.push(port.to_string());
        args.push("--".to_string());
        args.extend(client_args.iter().cloned());
        args
    }

    async fn run_client(&self, port: u16, client_args: &[String]) -> Result<Output> {
        let args = self.client_args(port, client_args);
        tracing::debug!(cmd = %self.settings.command, args = ?args, "invoking karma client");

        let output = Command::new(&self.settings.command)
            .args(&args)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains(NO_SERVER_MARKER) || stderr.contains(NO_SERVER_MARKER) {
            return Err(ExplorerError::Run(format!(
                "no karma server listening on port {}",
                port
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl TestRunner for KarmaRunner {
    async fn load_tests(&self, port: u16, timeout: Duration) -> Result<Vec<RawTestRecord>> {
        let timeout_ms = timeout.as_millis() as u64;
        self.loads.reset();

        let load = async {
            self.run_client(port, &[LOAD_FLAG.to_string()])
                .await
                .map_err(|e| ExplorerError::Load(e.to_string()))?;
            Ok::<_, ExplorerError>(self.loads.wait(timeout).await)
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(Ok(Some(tests))) => {
                tracing::info!(port, count = tests.len(), "loaded tests from karma");
                Ok(tests)
            }
            Ok(Ok(None)) | Err(_) => Err(ExplorerError::Timeout(timeout_ms)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn run_tests(&self, port: Option<u16>, test_ids: &[String], run_id: &RunId) -> Result<()> {
        let port = port.unwrap_or(self.default_port);
        let mut client_args = vec![format!("{}={}", RUN_ID_FLAG, run_id)];
        if let Some(pattern) = grep_pattern(test_ids) {
            client_args.push(format!("--grep={}", pattern));
        }

        let output = self.run_client(port, &client_args).await.map_err(|e| match e {
            ExplorerError::Run(_) => e,
            other => ExplorerError::Run(other.to_string()),
        })?;

        // karma run exits non-zero when specs fail, which is not a runner error
        tracing::info!(
            %run_id,
            port,
            tests = test_ids.len(),
            exit = ?output.status.code(),
            "karma run finished"
        );
        Ok(())
    }
}
