use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ExplorerError, Result};

pub const CONFIG_FILE: &str = "karma-explorer.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplorerConfig {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub listener: ListenerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSection {
    /// Workspace root, may contain `~` or `$VARS`
    #[serde(default = "default_root")]
    pub root: String,
    /// Label of the root node of every loaded tree
    #[serde(default = "default_root_label")]
    pub root_label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_npx")]
    pub command: String,
    /// `{project}`, `{config}` and `{port}` are substituted per project
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,
    /// First server port, each further project gets the next one
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Wait for this string in stdout before considering the server started
    #[serde(default = "default_ready_when")]
    pub ready_when: String,
    /// Timeout in seconds for ready_when
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_npx")]
    pub command: String,
    #[serde(default = "default_runner_args")]
    pub args: Vec<String>,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// How long a run waits for its own completion event before
    /// falling back to the latest one
    #[serde(default = "default_run_settle_ms")]
    pub run_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSection {
    #[serde(default = "default_listener_port")]
    pub port: u16,
}

fn default_root() -> String {
    ".".to_string()
}

fn default_root_label() -> String {
    "Angular".to_string()
}

fn default_npx() -> String {
    "npx".to_string()
}

fn default_server_args() -> Vec<String> {
    ["ng", "test", "{project}", "--karma-config", "{config}", "--watch"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_runner_args() -> Vec<String> {
    vec!["karma".to_string(), "run".to_string()]
}

fn default_server_port() -> u16 {
    9876
}

fn default_ready_when() -> String {
    "Connected on socket".to_string()
}

fn default_ready_timeout() -> u64 {
    120
}

fn default_load_timeout_ms() -> u64 {
    60_000
}

fn default_run_settle_ms() -> u64 {
    2_000
}

fn default_listener_port() -> u16 {
    9999
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            root_label: default_root_label(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            command: default_npx(),
            args: default_server_args(),
            port: default_server_port(),
            ready_when: default_ready_when(),
            ready_timeout: default_ready_timeout(),
        }
    }
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: default_npx(),
            args: default_runner_args(),
            load_timeout_ms: default_load_timeout_ms(),
            run_settle_ms: default_run_settle_ms(),
        }
    }
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            port: default_listener_port(),
        }
    }
}

impl ExplorerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExplorerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ExplorerError::Config(format!("Failed to parse {}: {}", CONFIG_FILE, e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.command.trim().is_empty() {
            return Err(ExplorerError::Config("server.command must not be empty".into()));
        }
        if self.runner.command.trim().is_empty() {
            return Err(ExplorerError::Config("runner.command must not be empty".into()));
        }
        if self.server.port == 0 || self.listener.port == 0 {
            return Err(ExplorerError::Config("ports must be non-zero".into()));
        }
        if self.server.port == self.listener.port {
            return Err(ExplorerError::Config(format!(
                "server.port and listener.port are both {}",
                self.server.port
            )));
        }

        Ok(())
    }

    /// Resolve the workspace root against the directory holding the config file
    pub fn workspace_root(&self, base_dir: &Path) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.workspace.root)
            .map_err(|e| ExplorerError::Config(format!("workspace.root: {}", e)))?;
        let root = PathBuf::from(expanded.as_ref());

        if root.is_absolute() {
            Ok(root)
        } else {
            Ok(base_dir.join(root))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[workspace]
root = "frontend"
root_label = "Web"

[server]
port = 9877
ready_when = "Executed"

[runner]
load_timeout_ms = 5000

[listener]
port = 9000
"#;

        let config = ExplorerConfig::parse(toml_content).unwrap();
        assert_eq!(config.workspace.root, "frontend");
        assert_eq!(config.workspace.root_label, "Web");
        assert_eq!(config.server.port, 9877);
        assert_eq!(config.server.ready_when, "Executed");
        assert_eq!(config.server.command, "npx");
        assert_eq!(config.runner.load_timeout_ms, 5000);
        assert_eq!(config.runner.run_settle_ms, 2000);
        assert_eq!(config.listener.port, 9000);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ExplorerConfig::parse("").unwrap();
        assert_eq!(config.workspace.root_label, "Angular");
        assert_eq!(config.server.port, 9876);
        assert_eq!(config.listener.port, 9999);
        assert!(config.server.args.contains(&"{project}".to_string()));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let config = ExplorerConfig::parse("[server]\nport = 9000\n[listener]\nport = 9000\n").unwrap();
        assert!(matches!(config.validate(), Err(ExplorerError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = ExplorerConfig::parse("[runner]\ncommand = \"  \"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let err = ExplorerConfig::parse("[server\nport = 1").unwrap_err();
        assert!(matches!(err, ExplorerError::Config(_)));
    }

    #[test]
    fn test_relative_root_resolves_against_base_dir() {
        let config = ExplorerConfig::parse("[workspace]\nroot = \"web\"\n").unwrap();
        let root = config.workspace_root(Path::new("/repo")).unwrap();
        assert_eq!(root, PathBuf::from("/repo/web"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExplorerConfig::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, ExplorerError::Config(_)));
    }
}
