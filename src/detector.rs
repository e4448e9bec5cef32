//! Project type detection
//!
//! Decides whether a project root can be driven by the Karma adapter by
//! looking for Angular CLI workspace files or a Karma config.

use std::path::Path;

use crate::error::{ExplorerError, Result};

/// Angular CLI workspace files, current and legacy
pub const ANGULAR_CLI_MARKERS: &[&str] = &["angular.json", ".angular-cli.json"];

pub const KARMA_CONFIG_MARKERS: &[&str] = &["karma.conf.js", "karma.conf.ts", "karma.conf.cjs"];

pub trait ProjectTypeDetector: Send + Sync {
    /// `Ok(false)` means "not applicable". Probe failures are errors.
    fn is_runnable_project(&self, root_path: &Path) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct AngularCliDetector;

impl AngularCliDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn is_angular_cli_project(&self, root_path: &Path) -> Result<bool> {
        any_marker(root_path, ANGULAR_CLI_MARKERS)
    }

    pub fn has_karma_config(&self, root_path: &Path) -> Result<bool> {
        any_marker(root_path, KARMA_CONFIG_MARKERS)
    }
}

impl ProjectTypeDetector for AngularCliDetector {
    fn is_runnable_project(&self, root_path: &Path) -> Result<bool> {
        let runnable = self.is_angular_cli_project(root_path)? || self.has_karma_config(root_path)?;
        tracing::debug!(root = %root_path.display(), runnable, "classified project root");
        Ok(runnable)
    }
}

fn any_marker(root_path: &Path, markers: &[&str]) -> Result<bool> {
    for marker in markers {
        let candidate = root_path.join(marker);
        let exists = candidate.try_exists().map_err(|source| ExplorerError::Detection {
            path: candidate.clone(),
            source,
        })?;
        if exists {
            return Ok(true);
        }
    }
    Ok(false)
}
