//! Test server lifecycle
//!
//! One long-lived Karma server per project, started on demand and kept warm
//! between loads. [`ServerRegistry`] owns a handle per project name so no
//! global running flag exists.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};

use crate::config::ServerSection;
use crate::error::{ExplorerError, Result};
use crate::project::Project;

/// Set on every server process so a Karma config can bind the assigned port
pub const PORT_ENV: &str = "KARMA_EXPLORER_PORT";

#[async_trait]
pub trait TestServerLifecycle: Send + Sync {
    fn is_running(&self) -> bool;

    /// Port the runner reaches this server on
    fn port(&self) -> u16;

    /// Resolves once the server is ready to accept runs
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Creates the lifecycle handle for a project
pub trait ServerFactory: Send + Sync {
    fn create(&self, project: &Project) -> Arc<dyn TestServerLifecycle>;
}

/// Lifecycle handles keyed by project name
pub struct ServerRegistry {
    factory: Arc<dyn ServerFactory>,
    handles: Mutex<HashMap<String, Arc<dyn TestServerLifecycle>>>,
}

impl ServerRegistry {
    pub fn new(factory: Arc<dyn ServerFactory>) -> Self {
        Self {
            factory,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The handle for `project`, created on first use
    pub fn handle(&self, project: &Project) -> Arc<dyn TestServerLifecycle> {
        let mut handles = lock(&self.handles);
        handles
            .entry(project.name.clone())
            .or_insert_with(|| self.factory.create(project))
            .clone()
    }

    /// Stop every running server, attempting all of them before reporting
    pub async fn shutdown_all(&self) -> Result<()> {
        let handles: Vec<(String, Arc<dyn TestServerLifecycle>)> = lock(&self.handles)
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();

        let mut errors = Vec::new();
        for (name, handle) in handles {
            if !handle.is_running() {
                continue;
            }
            tracing::info!(project = %name, "stopping test server");
            if let Err(e) = handle.stop().await {
                errors.push(format!("{}: {}", name, e));
            }
        }

        if !errors.is_empty() {
            return Err(ExplorerError::Server(errors.join(", ")));
        }

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds [`KarmaServer`] handles from the `[server]` config section
///
/// Each handle gets its own port, counting up from `server.port`, so warm
/// servers of different projects never answer each other's runs.
#[derive(Debug)]
pub struct KarmaServerFactory {
    settings: ServerSection,
    next_port: AtomicU16,
}

impl KarmaServerFactory {
    pub fn new(settings: ServerSection) -> Self {
        let next_port = AtomicU16::new(settings.port);
        Self { settings, next_port }
    }
}

impl ServerFactory for KarmaServerFactory {
    fn create(&self, project: &Project) -> Arc<dyn TestServerLifecycle> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(project = %project.name, port, "assigned test server port");
        Arc::new(KarmaServer::new(project.clone(), self.settings.clone(), port))
    }
}

/// A Karma server process, typically `ng test --watch`
pub struct KarmaServer {
    project: Project,
    settings: ServerSection,
    port: u16,
    child: Mutex<Option<Child>>,
}

impl KarmaServer {
    pub fn new(project: Project, settings: ServerSection, port: u16) -> Self {
        Self {
            project,
            settings,
            port,
            child: Mutex::new(None),
        }
    }

    /// Server arguments with `{project}`, `{config}` and `{port}` substituted
    pub fn args(&self) -> Vec<String> {
        let config = self.project.config_path.to_string_lossy();
        let port = self.port.to_string();
        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{project}", &self.project.name)
                    .replace("{config}", &config)
                    .replace("{port}", &port)
            })
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(self.args())
            .env(PORT_ENV, self.port.to_string())
            .current_dir(&self.project.root_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TestServerLifecycle for KarmaServer {
    fn is_running(&self) -> bool {
        let mut child = lock(&self.child);
        let alive = match child.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            *child = None;
        }
        alive
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(ExplorerError::Server(format!(
                "server for '{}' is already running",
                self.project.name
            )));
        }

        tracing::info!(
            project = %self.project.name,
            cmd = %self.settings.command,
            args = ?self.args(),
            port = self.port,
            "starting test server"
        );

        let mut child = self.command().spawn().map_err(|e| {
            ExplorerError::Server(format!("Failed to spawn {}: {}", self.settings.command, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExplorerError::Server("Failed to capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(BufReader::new(stderr).lines(), self.project.name.clone()));
        }

        let ready_timeout = Duration::from_secs(self.settings.ready_timeout);
        let ready = tokio::time::timeout(ready_timeout, wait_for_ready(stdout, &self.settings.ready_when)).await;

        let lines = match ready {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ExplorerError::Server(format!(
                    "'{}' not seen within {}s",
                    self.settings.ready_when, self.settings.ready_timeout
                )));
            }
        };

        tokio::spawn(drain(lines, self.project.name.clone()));
        *lock(&self.child) = Some(child);

        tracing::info!(project = %self.project.name, "test server ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let child = lock(&self.child).take();

        if let Some(mut child) = child {
            tracing::info!(project = %self.project.name, "stopping test server");
            if let Err(e) = child.kill().await {
                if matches!(child.try_wait(), Ok(None)) {
                    return Err(ExplorerError::Server(format!("Failed to stop server: {}", e)));
                }
            }
        }

        Ok(())
    }
}

/// Read output until a line contains `marker`, returning the remaining lines
pub async fn wait_for_ready<R: AsyncRead + Unpin>(stream: R, marker: &str) -> Result<Lines<BufReader<R>>> {
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        tracing::debug!(target: "karma_server", "{}", line);
        if line.contains(marker) {
            return Ok(lines);
        }
    }

    Err(ExplorerError::Server("server exited before it was ready".into()))
}

/// Keep a pipe flowing so the server never blocks on a full buffer
async fn drain<R: AsyncRead + Unpin>(mut lines: Lines<BufReader<R>>, project: String) {
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "karma_server", project = %project, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeServer {
        running: AtomicBool,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl TestServerLifecycle for FakeServer {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn port(&self) -> u16 {
            9876
        }

        async fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: Mutex<Vec<(String, Arc<FakeServer>)>>,
    }

    impl ServerFactory for FakeFactory {
        fn create(&self, project: &Project) -> Arc<dyn TestServerLifecycle> {
            let server = Arc::new(FakeServer::default());
            lock(&self.created).push((project.name.clone(), server.clone()));
            server
        }
    }

    fn project(name: &str) -> Project {
        Project::new(name, "/work", "/work/karma.conf.js", true)
    }

    #[test]
    fn test_registry_reuses_handle_per_project() {
        let factory = Arc::new(FakeFactory::default());
        let registry = ServerRegistry::new(factory.clone());

        let first = registry.handle(&project("shop"));
        let again = registry.handle(&project("shop"));
        let other = registry.handle(&project("admin"));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(lock(&factory.created).len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_only_running_servers() {
        let factory = Arc::new(FakeFactory::default());
        let registry = ServerRegistry::new(factory.clone());

        registry.handle(&project("shop")).start().await.unwrap();
        assert!(!registry.handle(&project("admin")).is_running());

        registry.shutdown_all().await.unwrap();

        let created = lock(&factory.created);
        for (name, server) in created.iter() {
            let expected = if name == "shop" { 1 } else { 0 };
            assert_eq!(server.stops.load(Ordering::SeqCst), expected, "{}", name);
            assert!(!server.is_running());
        }
    }

    #[test]
    fn test_server_args_substitution() {
        let server = KarmaServer::new(
            Project::new("ui-kit", "/work", "/work/projects/ui-kit/karma.conf.js", true),
            ServerSection::default(),
            9876,
        );

        assert_eq!(
            server.args(),
            vec![
                "ng",
                "test",
                "ui-kit",
                "--karma-config",
                "/work/projects/ui-kit/karma.conf.js",
                "--watch"
            ]
        );
    }

    #[test]
    fn test_port_placeholder_substitution() {
        let settings = ServerSection {
            command: "karma".to_string(),
            args: vec!["start".to_string(), "--port".to_string(), "{port}".to_string()],
            ..ServerSection::default()
        };
        let server = KarmaServer::new(project("shop"), settings, 9880);

        assert_eq!(server.args(), vec!["start", "--port", "9880"]);
        assert_eq!(server.port(), 9880);
    }

    #[test]
    fn test_factory_assigns_a_port_per_project() {
        let factory = Arc::new(KarmaServerFactory::new(ServerSection::default()));
        let registry = ServerRegistry::new(factory);

        let shop = registry.handle(&project("shop"));
        let admin = registry.handle(&project("admin"));

        assert_eq!(shop.port(), 9876);
        assert_eq!(admin.port(), 9877);
        assert_eq!(registry.handle(&project("shop")).port(), 9876);
    }

    #[tokio::test]
    async fn test_wait_for_ready_returns_remaining_lines() {
        let output = "Compiling...\nKarma server started\nConnected on socket abc\nExecuted 0 of 3\n";
        let mut rest = wait_for_ready(output.as_bytes(), "Connected on socket").await.unwrap();
        assert_eq!(rest.next_line().await.unwrap().as_deref(), Some("Executed 0 of 3"));
    }

    #[tokio::test]
    async fn test_wait_for_ready_fails_when_output_ends() {
        let err = wait_for_ready("Compiling...\nERROR\n".as_bytes(), "Connected on socket")
            .await
            .unwrap_err();
        assert!(matches!(err, ExplorerError::Server(_)));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_server_stopped() {
        let settings = ServerSection {
            command: "karma-explorer-missing-binary".to_string(),
            ..ServerSection::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let server = KarmaServer::new(
            Project::new("shop", dir.path(), dir.path().join("karma.conf.js"), true),
            settings,
            9876,
        );

        assert!(matches!(server.start().await, Err(ExplorerError::Server(_))));
        assert!(!server.is_running());
        server.stop().await.unwrap();
    }
}
