//! Test model definitions
//!
//! Data exchanged between the Karma reporter, the runner and the explorer:
//! raw spec records, the hierarchical test tree handed to the UI, and the
//! per-run completion snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A spec as reported by Karma while loading tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTestRecord {
    pub id: String,
    /// The `it(...)` description
    pub description: String,
    /// Enclosing `describe(...)` blocks, outermost first
    #[serde(default)]
    pub suite: Vec<String>,
    /// Suite path and description joined by spaces
    pub full_name: String,
}

impl RawTestRecord {
    pub fn new(suite: &[&str], description: &str) -> Self {
        let suite: Vec<String> = suite.iter().map(|s| s.to_string()).collect();
        let full_name = full_name_of(&suite, description);
        Self {
            id: full_name.clone(),
            description: description.to_string(),
            suite,
            full_name,
        }
    }
}

/// Karma identifies a spec by its suite path and description joined by spaces
pub fn full_name_of(suite: &[String], description: &str) -> String {
    let mut parts: Vec<&str> = suite.iter().map(|s| s.as_str()).collect();
    parts.push(description);
    parts.join(" ")
}

/// A node of a loaded test tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TestNode {
    Suite {
        id: String,
        label: String,
        children: Vec<TestNode>,
    },
    Test {
        /// Karma full name, accepted by `run_tests`
        id: String,
        label: String,
        full_name: String,
    },
}

impl TestNode {
    pub fn new_test(record: &RawTestRecord) -> Self {
        TestNode::Test {
            id: record.full_name.clone(),
            label: record.description.clone(),
            full_name: record.full_name.clone(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TestNode::Suite { id, .. } | TestNode::Test { id, .. } => id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            TestNode::Suite { label, .. } | TestNode::Test { label, .. } => label,
        }
    }

    pub fn children(&self) -> &[TestNode] {
        match self {
            TestNode::Suite { children, .. } => children,
            TestNode::Test { .. } => &[],
        }
    }

    fn collect_test_ids(&self, ids: &mut Vec<String>) {
        match self {
            TestNode::Test { id, .. } => ids.push(id.clone()),
            TestNode::Suite { children, .. } => {
                for child in children {
                    child.collect_test_ids(ids);
                }
            }
        }
    }
}

/// Root of a project's discovered tests
///
/// A project that is not runnable yields [`TestTree::empty`], with neither
/// label nor children. A tree built from records always has both, even when
/// no tests were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestTree {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TestNode>>,
}

impl TestTree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.children.is_none()
    }

    /// All test ids in tree order
    pub fn test_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for child in self.children.iter().flatten() {
            child.collect_test_ids(&mut ids);
        }
        ids
    }

    pub fn test_count(&self) -> usize {
        self.test_ids().len()
    }
}

/// Outcome of a single spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            RunStatus::Passed => "✓",
            RunStatus::Failed => "✗",
            RunStatus::Skipped => "⊘",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub test_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub failure_messages: Vec<String>,
}

/// Correlation token minted for every run request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Results of the most recent completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompletionSnapshot {
    /// Set when the reporter echoed back the id of the run it completed
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub results: Vec<RunResult>,
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl RunCompletionSnapshot {
    pub fn new(run_id: Option<RunId>, results: Vec<RunResult>) -> Self {
        Self {
            run_id,
            results,
            completed_at: Utc::now(),
        }
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn all_passed(&self) -> bool {
        self.count(RunStatus::Failed) == 0
    }
}
