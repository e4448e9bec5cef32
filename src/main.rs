use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use karma_explorer::config::CONFIG_FILE;
use karma_explorer::{
    AngularCliDetector, AngularProjectConfigLoader, Collaborators, ExplorerConfig, KarmaEventListener,
    KarmaRunner, KarmaServerFactory, Orchestrator, RunCompletionListener, RunCompletionSnapshot,
    RunStatus, ServerRegistry, SpecWatcher, TestLoadListener, TestNode, TestTree, TestTreeBuilder,
};

const LOG_ENV: &str = "KARMA_EXPLORER_LOG";

#[derive(Parser)]
#[command(name = "karma-explorer")]
#[command(about = "Load and run Angular Karma tests from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: karma-explorer.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the projects configured in the workspace
    Projects,

    /// Start the test server and print the test tree
    Load {
        project: String,

        /// Budget for loading specs once the server is up
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Load a project, then run the given tests (all if none given)
    Run {
        project: String,

        /// Test ids as printed by `load`
        tests: Vec<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Debug the given tests
    Debug {
        project: String,
        tests: Vec<String>,
    },

    /// Reload tests whenever spec files change
    Watch {
        project: String,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn main() {
    init_tracing();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<(ExplorerConfig, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None if Path::new(CONFIG_FILE).exists() => PathBuf::from(CONFIG_FILE),
        None => {
            let cwd = std::env::current_dir().context("Could not read current directory")?;
            return Ok((ExplorerConfig::default(), cwd));
        }
    };

    let config_path = std::fs::canonicalize(&path)
        .with_context(|| format!("Could not find config file: {}", path.display()))?;
    let config = ExplorerConfig::load(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;

    let base_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((config, base_dir))
}

/// Returns whether the command succeeded without failing tests
#[tokio::main]
async fn run() -> Result<bool> {
    let cli = Cli::parse();
    let (config, base_dir) = load_config(cli.config)?;
    let workspace_root = config.workspace_root(&base_dir)?;

    let completions = Arc::new(RunCompletionListener::new());
    let loads = Arc::new(TestLoadListener::new());

    let explorer = Orchestrator::new(Collaborators {
        detector: Arc::new(AngularCliDetector::new()),
        config_loader: Arc::new(AngularProjectConfigLoader::new(&workspace_root)),
        servers: ServerRegistry::new(Arc::new(KarmaServerFactory::new(config.server.clone()))),
        runner: Arc::new(KarmaRunner::new(
            config.runner.clone(),
            config.server.port,
            &workspace_root,
            loads.clone(),
        )),
        completions: completions.clone(),
        tree_builder: TestTreeBuilder::new(&config.workspace.root_label),
    })
    .with_run_settle(Duration::from_millis(config.runner.run_settle_ms));

    let needs_events = !matches!(cli.command, Commands::Projects | Commands::Debug { .. });
    let _events = if needs_events {
        Some(
            KarmaEventListener::new(completions, loads)
                .start(config.listener.port)
                .await
                .context("Could not start the reporter listener")?,
        )
    } else {
        None
    };

    let default_timeout = config.runner.load_timeout_ms;
    let result = match cli.command {
        Commands::Projects => cmd_projects(&explorer).await,
        Commands::Load { project, timeout_ms } => {
            cmd_load(&explorer, &project, timeout_ms.unwrap_or(default_timeout)).await
        }
        Commands::Run { project, tests, timeout_ms } => {
            cmd_run(&explorer, &project, tests, timeout_ms.unwrap_or(default_timeout)).await
        }
        Commands::Debug { project, tests } => cmd_debug(&explorer, &project, tests).await,
        Commands::Watch { project, timeout_ms } => {
            cmd_watch(&explorer, &project, timeout_ms.unwrap_or(default_timeout)).await
        }
    };

    // Never leave a karma server behind, whatever the command's outcome
    let shutdown = explorer.shutdown().await;
    let passed = result?;
    shutdown.context("Could not stop test servers")?;

    Ok(passed)
}

async fn cmd_projects(explorer: &Orchestrator) -> Result<bool> {
    let projects = explorer
        .load_projects_configuration()
        .await
        .context("Could not load workspace projects")?;

    if projects.is_empty() {
        println!("  {}", "No projects defined".dimmed());
        return Ok(true);
    }

    println!("{}", "Projects:".bold());
    for project in &projects {
        let marker = if project.is_enabled { "•".green() } else { "•".dimmed() };
        println!("  {} {}", marker, project.name.cyan());
        println!("    {} {}", "root:".dimmed(), project.root_path.display());
        println!("    {} {}", "karma:".dimmed(), project.config_path.display());
        if !project.is_enabled {
            println!("    {} {}", "test target:".dimmed(), "none".yellow());
        }
    }

    Ok(true)
}

async fn cmd_load(explorer: &Orchestrator, project: &str, timeout_ms: u64) -> Result<bool> {
    println!("{} Loading tests for {}...", "🔍".cyan(), project.bold());
    let tree = explorer
        .load_tests(project, timeout_ms)
        .await
        .with_context(|| format!("Could not load tests for '{}'", project))?;

    print_tree(project, &tree);
    Ok(true)
}

async fn cmd_run(explorer: &Orchestrator, project: &str, tests: Vec<String>, timeout_ms: u64) -> Result<bool> {
    let tree = explorer
        .load_tests(project, timeout_ms)
        .await
        .with_context(|| format!("Could not load tests for '{}'", project))?;

    if tree.is_empty() {
        println!("{} {} is not a Karma project", "!".yellow(), project.bold());
        return Ok(true);
    }

    let label = if tests.is_empty() {
        format!("all {} test(s)", tree.test_count())
    } else {
        format!("{} test(s)", tests.len())
    };
    println!("\n{} Running {}\n", "→".blue(), label);

    let snapshot = explorer.run_tests(tests).await.context("Test run failed")?;

    match snapshot {
        Some(snapshot) => Ok(print_results(&snapshot)),
        None => {
            println!("{} No completion reported by karma", "!".yellow());
            Ok(false)
        }
    }
}

async fn cmd_debug(explorer: &Orchestrator, project: &str, tests: Vec<String>) -> Result<bool> {
    explorer
        .debug_tests(tests)
        .await
        .with_context(|| format!("Could not debug tests for '{}'", project))?;
    Ok(true)
}

async fn cmd_watch(explorer: &Orchestrator, project: &str, timeout_ms: u64) -> Result<bool> {
    let tree = explorer
        .load_tests(project, timeout_ms)
        .await
        .with_context(|| format!("Could not load tests for '{}'", project))?;
    println!("{} Found {} tests", "✓".green(), tree.test_count());

    if tree.is_empty() {
        println!("{} {} is not a Karma project", "!".yellow(), project.bold());
        return Ok(true);
    }

    let root = explorer.active_root().await.unwrap_or_default();
    println!(
        "\n{} {} {}\n",
        "👀".cyan(),
        "Watching for changes in".bold(),
        root.display()
    );
    println!("{}", "Press Ctrl+C to stop\n".dimmed());

    let watcher = SpecWatcher::new(explorer, timeout_ms);
    let watch = watcher.run(|files, result| {
        println!("\n📝 Files changed: {}", files.join(", "));
        match result {
            Ok(tree) => println!("{} Reloaded {} tests", "✓".green(), tree.test_count()),
            Err(e) => eprintln!("{} Reload failed: {}", "✗".red(), e),
        }
    });

    tokio::select! {
        result = watch => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n✓ Watch stopped via Ctrl+C");
        }
    }

    Ok(true)
}

fn print_tree(project: &str, tree: &TestTree) {
    let (label, children) = match (&tree.label, &tree.children) {
        (Some(label), Some(children)) => (label, children),
        _ => {
            println!("{} {} is not a Karma project", "!".yellow(), project.bold());
            return;
        }
    };

    println!("\n{} {}", "📦".cyan(), label.bold());
    if children.is_empty() {
        println!("  {}", "No tests found".dimmed());
    }
    for node in children {
        print_node(node, 1);
    }
    println!("\n{} {} test(s)", "✓".green(), tree.test_count());
}

fn print_node(node: &TestNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match node {
        TestNode::Suite { label, children, .. } => {
            println!("{}{} {}", indent, "▸".blue(), label.bold());
            for child in children {
                print_node(child, depth + 1);
            }
        }
        TestNode::Test { id, label, .. } => {
            println!("{}{} {} {}", indent, "○".dimmed(), label, format!("[{}]", id).dimmed());
        }
    }
}

fn print_results(snapshot: &RunCompletionSnapshot) -> bool {
    for result in &snapshot.results {
        let symbol = match result.status {
            RunStatus::Passed => result.status.symbol().green(),
            RunStatus::Failed => result.status.symbol().red(),
            RunStatus::Skipped => result.status.symbol().dimmed(),
        };
        let duration = result
            .duration_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        println!("  {} {}{}", symbol, result.test_id, duration.dimmed());
        for message in &result.failure_messages {
            println!("      {}", message.red());
        }
    }

    let passed = snapshot.count(RunStatus::Passed);
    let failed = snapshot.count(RunStatus::Failed);
    let skipped = snapshot.count(RunStatus::Skipped);

    println!("{}", "─".repeat(50).dimmed());
    if failed == 0 {
        println!(
            "{} {} passed, {} skipped",
            "✓".green().bold(),
            passed,
            skipped
        );
    } else {
        println!(
            "{} {} failed, {} passed, {} skipped",
            "✗".red().bold(),
            failed,
            passed,
            skipped
        );
    }

    snapshot.all_passed()
}
