mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use kugutsu_core::agents::RoleConfig;
use kugutsu_core::executor::ClaudeCodeExecutor;
use kugutsu_core::planner::{Planner, ProductOwnerPlanner};
use kugutsu_core::{PipelineConfig, PipelineManager};

#[derive(Parser)]
#[command(name = "kugutsu", about = "Multi-agent development pipeline orchestrator")]
struct Cli {
    /// The development request to carry out
    request: String,

    /// Path to the base git repository
    #[arg(long, default_value = ".")]
    base_repo: PathBuf,

    /// Directory for per-task worktrees (default: sibling of the base repo)
    #[arg(long)]
    worktree_base: Option<PathBuf>,

    /// Maximum number of concurrent engineers
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=100))]
    max_engineers: Option<u16>,

    /// Turn budget per agent invocation
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=50))]
    max_turns: Option<u16>,

    /// Branch that completed tasks merge into
    #[arg(long)]
    base_branch: Option<String>,

    /// Pull the base branch from origin before each merge
    #[arg(long)]
    use_remote: bool,

    /// Remove worktrees for merged tasks when the run finishes
    #[arg(long)]
    cleanup: bool,
}

/// Build the pipeline config from flags over the config file over defaults.
fn resolve_config(cli: &Cli, file: &config::ConfigFile) -> PipelineConfig {
    let mut cfg = PipelineConfig::new(cli.base_repo.clone());

    if let Some(root) = cli
        .worktree_base
        .clone()
        .or_else(|| file.pipeline.worktree_base.clone())
    {
        cfg.worktree_root = root;
    }
    if let Some(branch) = cli
        .base_branch
        .clone()
        .or_else(|| file.pipeline.base_branch.clone())
    {
        cfg.base_branch = branch;
    }
    if let Some(n) = cli
        .max_engineers
        .map(usize::from)
        .or(file.pipeline.max_engineers)
    {
        cfg.max_concurrent_engineers = n;
    }
    if let Some(n) = cli.max_turns.map(u32::from).or(file.pipeline.max_turns) {
        cfg.max_turns = n;
    }
    cfg.use_remote = cli.use_remote || file.pipeline.use_remote.unwrap_or(false);
    cfg.cleanup_on_success = cli.cleanup;
    cfg
}

async fn run(cli: Cli) -> i32 {
    let file = match config::load_config() {
        Ok(file) => file,
        Err(e) => {
            eprintln!("kugutsu: {e:#}");
            return 2;
        }
    };
    let cfg = resolve_config(&cli, &file);

    if let Err(e) = cfg.validate() {
        eprintln!("kugutsu: {e}");
        return 2;
    }

    let executor = Arc::new(ClaudeCodeExecutor::new());

    // Plan: ProductOwner decomposes the request into the task list.
    let planner = ProductOwnerPlanner::new(
        executor.clone(),
        RoleConfig::product_owner(cfg.max_turns),
        &cfg.base_repo,
        tokio_util::sync::CancellationToken::new(),
    );
    let tasks = match planner.plan(&cli.request).await {
        Ok(tasks) => tasks,
        Err(e) => {
            eprintln!("kugutsu: planning failed: {e:#}");
            return 2;
        }
    };
    println!("Planned {} tasks:", tasks.len());
    for task in &tasks {
        println!("  [{}] {} ({})", task.task_type, task.title, task.priority);
    }

    let manager = match PipelineManager::new(cfg, tasks, executor) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("kugutsu: setup failed: {e}");
            return 2;
        }
    };

    // Ctrl-C triggers a graceful shutdown: executors are cancelled, any
    // in-flight merge finishes so the base branch stays consistent.
    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let report = manager.run().await;
    print!("{}", report.render());
    report.exit_code()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}
