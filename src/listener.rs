//! Karma reporter events
//!
//! The Karma reporter pushes newline-delimited JSON events over TCP.
//! [`KarmaEventListener`] decodes them and fans them out to two shared slots:
//! [`TestLoadListener`] for discovered specs and [`RunCompletionListener`]
//! for finished runs.

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::test_model::{RawTestRecord, RunCompletionSnapshot, RunId, RunResult};

/// Event sent by the Karma reporter, one JSON object per line
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReporterEvent {
    TestsLoaded {
        #[serde(default)]
        tests: Vec<RawTestRecord>,
    },
    RunStart {
        #[serde(default)]
        run_id: Option<RunId>,
    },
    SpecComplete {
        result: RunResult,
    },
    RunComplete {
        #[serde(default)]
        run_id: Option<RunId>,
        #[serde(default)]
        results: Vec<RunResult>,
    },
    BrowserError {
        message: String,
    },
}

/// Latest completed run
///
/// A single slot: every completion replaces the previous one. Callers that
/// know the [`RunId`] of their run can wait for that run specifically.
#[derive(Debug)]
pub struct RunCompletionListener {
    slot: watch::Sender<Option<Arc<RunCompletionSnapshot>>>,
}

impl Default for RunCompletionListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCompletionListener {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    pub fn record(&self, snapshot: RunCompletionSnapshot) {
        self.slot.send_replace(Some(Arc::new(snapshot)));
    }

    /// The run complete event, if any run has completed yet
    pub fn latest(&self) -> Option<RunCompletionSnapshot> {
        self.slot.borrow().as_deref().cloned()
    }

    /// Wait until the slot holds the completion of `run_id`
    pub async fn wait_for(&self, run_id: &RunId, timeout: Duration) -> Option<RunCompletionSnapshot> {
        let run_id = *run_id;
        let mut rx = self.slot.subscribe();
        let matched = rx.wait_for(|slot| {
            slot.as_ref()
                .map_or(false, |snapshot| snapshot.run_id == Some(run_id))
        });

        let snapshot = match tokio::time::timeout(timeout, matched).await {
            Ok(Ok(slot)) => slot.as_deref().cloned(),
            _ => None,
        };
        snapshot
    }
}

/// Specs reported by the most recent load
#[derive(Debug)]
pub struct TestLoadListener {
    slot: watch::Sender<Option<Arc<Vec<RawTestRecord>>>>,
}

impl Default for TestLoadListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLoadListener {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Forget the previous load so the next wait only sees fresh specs
    pub fn reset(&self) {
        self.slot.send_replace(None);
    }

    pub fn record(&self, tests: Vec<RawTestRecord>) {
        self.slot.send_replace(Some(Arc::new(tests)));
    }

    /// `None` when nothing was loaded within `timeout`
    pub async fn wait(&self, timeout: Duration) -> Option<Vec<RawTestRecord>> {
        let mut rx = self.slot.subscribe();
        let loaded = rx.wait_for(|slot| slot.is_some());

        let tests = match tokio::time::timeout(timeout, loaded).await {
            Ok(Ok(slot)) => slot.as_deref().cloned(),
            _ => None,
        };
        tests
    }
}

/// TCP endpoint the Karma reporter connects to
#[derive(Debug, Clone)]
pub struct KarmaEventListener {
    completions: Arc<RunCompletionListener>,
    loads: Arc<TestLoadListener>,
}

/// A running [`KarmaEventListener`]; aborts its accept loop on drop
pub struct ListenerHandle {
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl KarmaEventListener {
    pub fn new(completions: Arc<RunCompletionListener>, loads: Arc<TestLoadListener>) -> Self {
        Self { completions, loads }
    }

    /// Bind on localhost and accept reporter connections in the background
    pub async fn start(self, port: u16) -> Result<ListenerHandle> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening for karma reporter events");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "karma reporter connected");
                        let events = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = events.consume(stream).await {
                                tracing::warn!(%peer, error = %e, "reporter connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept reporter connection");
                    }
                }
            }
        });

        Ok(ListenerHandle { local_addr, task })
    }

    /// Read events line by line until the stream ends
    pub async fn consume<R: AsyncRead + Unpin>(&self, stream: R) -> Result<()> {
        let mut lines = BufReader::new(stream).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<ReporterEvent>(line) {
                Ok(event) => self.dispatch(event),
                Err(e) => tracing::warn!(error = %e, "skipping malformed reporter event"),
            }
        }

        Ok(())
    }

    pub fn dispatch(&self, event: ReporterEvent) {
        match event {
            ReporterEvent::TestsLoaded { tests } => {
                tracing::info!(count = tests.len(), "tests loaded");
                self.loads.record(tests);
            }
            ReporterEvent::RunStart { run_id } => {
                tracing::debug!(run_id = ?run_id, "run started");
            }
            ReporterEvent::SpecComplete { result } => {
                tracing::debug!(test = %result.test_id, status = ?result.status, "spec complete");
            }
            ReporterEvent::RunComplete { run_id, results } => {
                tracing::info!(run_id = ?run_id, count = results.len(), "run complete");
                self.completions.record(RunCompletionSnapshot::new(run_id, results));
            }
            ReporterEvent::BrowserError { message } => {
                tracing::warn!(%message, "browser error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::RunStatus;
    use tokio::io::AsyncWriteExt;

    fn listener() -> (KarmaEventListener, Arc<RunCompletionListener>, Arc<TestLoadListener>) {
        let completions = Arc::new(RunCompletionListener::new());
        let loads = Arc::new(TestLoadListener::new());
        (
            KarmaEventListener::new(completions.clone(), loads.clone()),
            completions,
            loads,
        )
    }

    #[test]
    fn test_latest_is_last_write_wins() {
        let completions = RunCompletionListener::new();
        assert!(completions.latest().is_none());

        completions.record(RunCompletionSnapshot::new(None, vec![]));
        let second = RunId::new();
        completions.record(RunCompletionSnapshot::new(Some(second), vec![]));

        assert_eq!(completions.latest().unwrap().run_id, Some(second));
    }

    #[tokio::test]
    async fn test_wait_for_ignores_other_runs() {
        let completions = Arc::new(RunCompletionListener::new());
        let mine = RunId::new();
        completions.record(RunCompletionSnapshot::new(Some(RunId::new()), vec![]));

        let waiter = {
            let completions = completions.clone();
            tokio::spawn(async move { completions.wait_for(&mine, Duration::from_secs(2)).await })
        };

        completions.record(RunCompletionSnapshot::new(Some(RunId::new()), vec![]));
        completions.record(RunCompletionSnapshot::new(Some(mine), vec![]));

        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.run_id, Some(mine));
    }

    #[tokio::test]
    async fn test_wait_for_returns_already_recorded_run() {
        let completions = RunCompletionListener::new();
        let run_id = RunId::new();
        completions.record(RunCompletionSnapshot::new(Some(run_id), vec![]));

        let snapshot = completions.wait_for(&run_id, Duration::from_millis(10)).await;
        assert!(snapshot.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let completions = RunCompletionListener::new();
        completions.record(RunCompletionSnapshot::new(None, vec![]));

        let snapshot = completions.wait_for(&RunId::new(), Duration::from_millis(20)).await;
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn test_load_wait_after_reset() {
        let loads = TestLoadListener::new();
        loads.record(vec![RawTestRecord::new(&["Old"], "stale")]);
        loads.reset();

        assert!(loads.wait(Duration::from_millis(20)).await.is_none());

        loads.record(vec![RawTestRecord::new(&["New"], "fresh")]);
        let tests = loads.wait(Duration::from_millis(20)).await.unwrap();
        assert_eq!(tests[0].full_name, "New fresh");
    }

    #[tokio::test]
    async fn test_consume_skips_malformed_lines() {
        let (events, completions, loads) = listener();
        let run_id = RunId::new();
        let input = format!(
            concat!(
                "{{\"event\":\"tests_loaded\",\"tests\":[{{\"id\":\"1\",\"description\":\"works\",\"suite\":[\"A\"],\"fullName\":\"A works\"}}]}}\n",
                "this is not json\n",
                "\n",
                "{{\"event\":\"spec_complete\",\"result\":{{\"testId\":\"A works\",\"status\":\"passed\"}}}}\n",
                "{{\"event\":\"run_complete\",\"run_id\":\"{}\",\"results\":[{{\"testId\":\"A works\",\"status\":\"failed\",\"failureMessages\":[\"boom\"]}}]}}\n",
            ),
            run_id
        );

        events.consume(input.as_bytes()).await.unwrap();

        let tests = loads.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(tests.len(), 1);

        let snapshot = completions.latest().unwrap();
        assert_eq!(snapshot.run_id, Some(run_id));
        assert_eq!(snapshot.results[0].status, RunStatus::Failed);
        assert_eq!(snapshot.results[0].failure_messages, vec!["boom"]);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (events, completions, _loads) = listener();
        let handle = events.start(0).await.unwrap();
        let run_id = RunId::new();

        let mut stream = tokio::net::TcpStream::connect(handle.local_addr).await.unwrap();
        let line = format!("{{\"event\":\"run_complete\",\"run_id\":\"{}\",\"results\":[]}}\n", run_id);
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let snapshot = completions.wait_for(&run_id, Duration::from_secs(2)).await;
        assert!(snapshot.is_some());
    }
}
