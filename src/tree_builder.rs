//! Shapes raw Karma spec records into the hierarchical test tree
//!
//! Suites are created the first time a suite path is seen and siblings
//! keep first-appearance order, so identical input always yields an
//! identical tree.

use crate::test_model::{RawTestRecord, TestNode, TestTree};

pub const DEFAULT_ROOT_LABEL: &str = "Angular";

#[derive(Debug, Clone)]
pub struct TestTreeBuilder {
    root_label: String,
}

impl Default for TestTreeBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_LABEL)
    }
}

impl TestTreeBuilder {
    pub fn new(root_label: &str) -> Self {
        Self {
            root_label: root_label.to_string(),
        }
    }

    pub fn build(&self, records: &[RawTestRecord]) -> TestTree {
        let mut children: Vec<TestNode> = Vec::new();

        for record in records {
            insert(&mut children, record, 0);
        }

        TestTree {
            label: Some(self.root_label.clone()),
            children: Some(children),
        }
    }
}

/// Place `record` below the suites of its path from `depth` on, creating
/// the missing ones
fn insert(siblings: &mut Vec<TestNode>, record: &RawTestRecord, depth: usize) {
    let Some(label) = record.suite.get(depth) else {
        siblings.push(TestNode::new_test(record));
        return;
    };
    let id = record.suite[..=depth].join(" ");

    for node in siblings.iter_mut() {
        if let TestNode::Suite { id: suite_id, children, .. } = node {
            if *suite_id == id {
                insert(children, record, depth + 1);
                return;
            }
        }
    }

    let mut children = Vec::new();
    insert(&mut children, record, depth + 1);
    siblings.push(TestNode::Suite {
        id,
        label: label.clone(),
        children,
    });
}
