//! Workspace project enumeration
//!
//! Reads `angular.json` (or the legacy `.angular-cli.json`) and produces one
//! [`Project`] per configured Angular project.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ExplorerError, Result};

const ANGULAR_JSON: &str = "angular.json";
const LEGACY_ANGULAR_CLI_JSON: &str = ".angular-cli.json";
const DEFAULT_KARMA_CONFIG: &str = "karma.conf.js";

/// A configured Angular project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    /// Unique within a workspace
    pub name: String,
    pub root_path: PathBuf,
    /// Karma config used to start the test server
    pub config_path: PathBuf,
    /// False for projects without a Karma test target
    pub is_enabled: bool,
}

impl Project {
    pub fn new(name: &str, root_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>, is_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            root_path: root_path.into(),
            config_path: config_path.into(),
            is_enabled,
        }
    }
}

pub trait ProjectConfigLoader: Send + Sync {
    fn get_all_projects(&self) -> Result<Vec<Project>>;
}

#[derive(Debug, Deserialize)]
struct AngularJson {
    #[serde(default)]
    projects: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AngularJsonProject {
    #[serde(default)]
    root: String,
    #[serde(default, alias = "targets")]
    architect: Option<Architect>,
}

#[derive(Debug, Deserialize)]
struct Architect {
    test: Option<TestTarget>,
}

#[derive(Debug, Deserialize)]
struct TestTarget {
    #[serde(default)]
    builder: Option<String>,
    #[serde(default)]
    options: Option<TestOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestOptions {
    karma_config: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyAngularCliJson {
    project: Option<LegacyProjectName>,
    test: Option<LegacyTest>,
}

#[derive(Debug, Deserialize)]
struct LegacyProjectName {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyTest {
    karma: Option<LegacyKarma>,
}

#[derive(Debug, Deserialize)]
struct LegacyKarma {
    config: Option<String>,
}

/// Loads projects from the Angular CLI workspace file at `workspace_root`
#[derive(Debug, Clone)]
pub struct AngularProjectConfigLoader {
    workspace_root: PathBuf,
}

impl AngularProjectConfigLoader {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    fn read(&self, file: &Path) -> Result<String> {
        fs::read_to_string(file)
            .map_err(|e| ExplorerError::Config(format!("Failed to read {}: {}", file.display(), e)))
    }

    fn load_angular_json(&self, file: &Path) -> Result<Vec<Project>> {
        let content = self.read(file)?;
        let workspace: AngularJson = serde_json::from_str(&content)
            .map_err(|e| ExplorerError::Config(format!("Failed to parse {}: {}", file.display(), e)))?;

        let mut projects = Vec::new();
        for (name, value) in workspace.projects {
            let project: AngularJsonProject = serde_json::from_value(value).map_err(|e| {
                ExplorerError::Config(format!("Invalid project '{}' in {}: {}", name, file.display(), e))
            })?;

            let root_path = self.workspace_root.join(&project.root);
            let test = project.architect.and_then(|a| a.test);
            let is_enabled = test
                .as_ref()
                .map(|t| t.builder.as_deref().map_or(true, |b| b.contains("karma")))
                .unwrap_or(false);
            let config_path = test
                .and_then(|t| t.options)
                .and_then(|o| o.karma_config)
                .map(|c| self.workspace_root.join(c))
                .unwrap_or_else(|| root_path.join(DEFAULT_KARMA_CONFIG));

            projects.push(Project {
                name,
                root_path,
                config_path,
                is_enabled,
            });
        }

        Ok(projects)
    }

    fn load_legacy(&self, file: &Path) -> Result<Vec<Project>> {
        let content = self.read(file)?;
        let legacy: LegacyAngularCliJson = serde_json::from_str(&content)
            .map_err(|e| ExplorerError::Config(format!("Failed to parse {}: {}", file.display(), e)))?;

        let name = legacy
            .project
            .and_then(|p| p.name)
            .or_else(|| {
                self.workspace_root
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "project".to_string());

        let karma_config = legacy.test.and_then(|t| t.karma).and_then(|k| k.config);
        let is_enabled = karma_config.is_some();
        let config_path = self
            .workspace_root
            .join(karma_config.as_deref().unwrap_or(DEFAULT_KARMA_CONFIG));

        Ok(vec![Project {
            name,
            root_path: self.workspace_root.clone(),
            config_path,
            is_enabled,
        }])
    }
}

impl ProjectConfigLoader for AngularProjectConfigLoader {
    fn get_all_projects(&self) -> Result<Vec<Project>> {
        let angular_json = self.workspace_root.join(ANGULAR_JSON);
        let legacy = self.workspace_root.join(LEGACY_ANGULAR_CLI_JSON);

        let projects = if angular_json.is_file() {
            self.load_angular_json(&angular_json)?
        } else if legacy.is_file() {
            self.load_legacy(&legacy)?
        } else {
            return Err(ExplorerError::Config(format!(
                "No {} or {} found in {}",
                ANGULAR_JSON,
                LEGACY_ANGULAR_CLI_JSON,
                self.workspace_root.display()
            )));
        };

        tracing::debug!(count = projects.len(), "loaded workspace projects");
        Ok(projects)
    }
}
