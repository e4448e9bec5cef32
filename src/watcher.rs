//! File watcher for automatic test reloading
//!
//! Watches the active project and reloads its tests whenever a spec file or
//! Karma config changes.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;

use crate::error::{ExplorerError, Result};
use crate::orchestrator::Orchestrator;
use crate::test_model::TestTree;

const DEBOUNCE_MS: u128 = 300;
const EXCLUDED_DIRS: &[&str] = &["node_modules", "dist", ".git", ".angular", "coverage"];

/// Whether a change to `path` can alter the loaded tests
pub fn is_relevant(path: &Path) -> bool {
    let excluded = path.components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        EXCLUDED_DIRS.iter().any(|exc| part == *exc)
    });
    if excluded {
        return false;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    name.ends_with(".spec.ts") || name.starts_with("karma.conf.")
}

/// Reloads the active project of an [`Orchestrator`] when its specs change
pub struct SpecWatcher<'a> {
    explorer: &'a Orchestrator,
    timeout_ms: u64,
}

impl<'a> SpecWatcher<'a> {
    pub fn new(explorer: &'a Orchestrator, timeout_ms: u64) -> Self {
        Self { explorer, timeout_ms }
    }

    /// Watch the active project's root until the watcher channel closes,
    /// reporting each reload
    pub async fn run<F>(&self, on_reload: F) -> Result<()>
    where
        F: FnMut(&[String], Result<TestTree>),
    {
        let (project, root) = self.target().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            Config::default(),
        )?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), project = %project, "watching for spec changes");

        self.reload_on_events(rx, &project, &root, on_reload).await;
        Ok(())
    }

    async fn target(&self) -> Result<(String, PathBuf)> {
        let project = self.explorer.active_project().await;
        let root = self.explorer.active_root().await;
        match (project, root) {
            (Some(project), Some(root)) => Ok((project, root)),
            _ => Err(ExplorerError::Load("no project has been loaded yet".into())),
        }
    }

    async fn reload_on_events<F>(
        &self,
        mut rx: mpsc::UnboundedReceiver<Event>,
        project: &str,
        root: &Path,
        mut on_reload: F,
    ) where
        F: FnMut(&[String], Result<TestTree>),
    {
        let mut last_run: Option<Instant> = None;

        while let Some(event) = rx.recv().await {
            if last_run.is_some_and(|at| at.elapsed().as_millis() < DEBOUNCE_MS) {
                continue;
            }

            let changed_files = changed_files(&event, root);
            if changed_files.is_empty() {
                continue;
            }

            // Stamp before loading so edits made during the reload still count
            last_run = Some(Instant::now());

            tracing::debug!(files = ?changed_files, "spec files changed");
            let result = self.explorer.load_tests(project, self.timeout_ms).await;

            on_reload(&changed_files, result);
        }
    }
}

fn changed_files(event: &Event, root: &Path) -> Vec<String> {
    event
        .paths
        .iter()
        .filter(|p| is_relevant(p))
        .filter_map(|p| {
            p.strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ProjectTypeDetector;
    use crate::listener::RunCompletionListener;
    use crate::orchestrator::Collaborators;
    use crate::project::{Project, ProjectConfigLoader};
    use crate::server::{ServerFactory, ServerRegistry, TestServerLifecycle};
    use crate::test_model::{RawTestRecord, RunId};
    use crate::test_runner::TestRunner;
    use crate::tree_builder::TestTreeBuilder;
    use async_trait::async_trait;
    use notify::event::{EventKind, ModifyKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct AngularProject;

    impl ProjectTypeDetector for AngularProject {
        fn is_runnable_project(&self, _root_path: &Path) -> Result<bool> {
            Ok(true)
        }
    }

    impl ProjectConfigLoader for AngularProject {
        fn get_all_projects(&self) -> Result<Vec<Project>> {
            Ok(vec![Project::new("p", "/work/p", "/work/p/karma.conf.js", true)])
        }
    }

    #[derive(Default)]
    struct Server {
        running: AtomicBool,
    }

    #[async_trait]
    impl TestServerLifecycle for Server {
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
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ServerFactory for AngularProject {
        fn create(&self, _project: &Project) -> Arc<dyn TestServerLifecycle> {
            Arc::new(Server::default())
        }
    }

    struct SlowRunner {
        delay: Duration,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl TestRunner for SlowRunner {
        async fn load_tests(&self, _port: u16, _timeout: Duration) -> Result<Vec<RawTestRecord>> {
            tokio::time::sleep(self.delay).await;
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawTestRecord::new(&["AppComponent"], "should create")])
        }

        async fn run_tests(&self, _port: Option<u16>, _test_ids: &[String], _run_id: &RunId) -> Result<()> {
            Ok(())
        }
    }

    fn explorer(runner: Arc<SlowRunner>) -> Orchestrator {
        Orchestrator::new(Collaborators {
            detector: Arc::new(AngularProject),
            config_loader: Arc::new(AngularProject),
            servers: ServerRegistry::new(Arc::new(AngularProject)),
            runner,
            completions: Arc::new(RunCompletionListener::new()),
            tree_builder: TestTreeBuilder::default(),
        })
    }

    fn slow_runner(delay_ms: u64) -> Arc<SlowRunner> {
        Arc::new(SlowRunner {
            delay: Duration::from_millis(delay_ms),
            loads: AtomicUsize::new(0),
        })
    }

    fn modified(path: &str) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from(path))
    }

    async fn reloads_for(explorer: &Orchestrator, events: Vec<(u64, &'static str)>) -> Vec<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (delay_ms, path) in events {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = tx.send(modified(path));
            }
        });

        let mut reloads = Vec::new();
        SpecWatcher::new(explorer, 2000)
            .reload_on_events(rx, "p", Path::new("/work/p"), |files, result| {
                assert!(result.is_ok());
                reloads.push(files.to_vec());
            })
            .await;
        reloads
    }

    #[tokio::test]
    async fn test_edit_during_reload_triggers_another_reload() {
        let runner = slow_runner(600);
        let explorer = explorer(runner.clone());

        let reloads = reloads_for(
            &explorer,
            vec![(0, "/work/p/src/a.spec.ts"), (200, "/work/p/src/b.spec.ts")],
        )
        .await;

        assert_eq!(reloads, vec![vec!["src/a.spec.ts"], vec!["src/b.spec.ts"]]);
        assert_eq!(runner.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_burst_of_changes_reloads_once() {
        let runner = slow_runner(0);
        let explorer = explorer(runner.clone());

        let reloads = reloads_for(
            &explorer,
            vec![(0, "/work/p/src/a.spec.ts"), (50, "/work/p/src/b.spec.ts")],
        )
        .await;

        assert_eq!(reloads, vec![vec!["src/a.spec.ts"]]);
        assert_eq!(runner.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_irrelevant_changes_do_not_reload() {
        let runner = slow_runner(0);
        let explorer = explorer(runner.clone());

        let reloads = reloads_for(&explorer, vec![(0, "/work/p/src/app.component.ts")]).await;

        assert!(reloads.is_empty());
        assert_eq!(runner.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_watch_requires_a_loaded_project() {
        let explorer = explorer(slow_runner(0));

        let err = SpecWatcher::new(&explorer, 2000).run(|_, _| {}).await.unwrap_err();

        assert!(matches!(err, ExplorerError::Load(_)));
    }

    #[tokio::test]
    async fn test_watch_targets_the_active_project() {
        let explorer = explorer(slow_runner(0));
        explorer.load_tests("p", 2000).await.unwrap();

        let (project, root) = SpecWatcher::new(&explorer, 2000).target().await.unwrap();

        assert_eq!(project, "p");
        assert_eq!(root, PathBuf::from("/work/p"));
    }

    #[test]
    fn test_spec_files_are_relevant() {
        assert!(is_relevant(Path::new("/ws/src/app/app.component.spec.ts")));
        assert!(is_relevant(Path::new("/ws/projects/ui-kit/karma.conf.js")));
    }

    #[test]
    fn test_sources_and_excluded_dirs_are_ignored() {
        assert!(!is_relevant(Path::new("/ws/src/app/app.component.ts")));
        assert!(!is_relevant(Path::new("/ws/node_modules/lib/thing.spec.ts")));
        assert!(!is_relevant(Path::new("/ws/.angular/cache/x.spec.ts")));
        assert!(!is_relevant(Path::new("/ws/dist/karma.conf.js")));
    }

    #[test]
    fn test_directory_named_like_spec_prefix_is_not_excluded() {
        assert!(is_relevant(Path::new("/ws/distribution/a.spec.ts")));
    }
}
