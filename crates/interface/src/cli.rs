//! CLI - 命令行接口
//!
//! 可用命令：
//! - octo index                       - 增量索引工作区
//! - octo search "query"              - 语义检索
//! - octo sessions list|show|cleanup|export|import
//! - octo shadow status|commit|discard
//! - octo evaluate <session-id>       - 评估已保存的会话
//!
//! 命令行不做模型推理：需要生成能力的 Agent 循环由嵌入方注入。

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use octo_cognition::IndexError;
use octo_core::{
    ConfigError, EnvCredentials, FlowEntryType, GenerationCapability, GenerationRequest, GenerationResponse,
    OctoConfig, ProviderError,
};
use octo_persistence::{DEFAULT_KEEP_SESSIONS, PersistenceError, SessionPersistence, SessionSnapshot};
use octo_runtime::workspace::{CommitOutcome, ShadowError, StagedKind};
use octo_runtime::{AgentContext, AgentError, CoreAgent, EndToEndScenario, EvaluationResult, Evaluator, ShadowStore};

/// CLI Errors
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Shadow store error: {0}")]
    Shadow(#[from] ShadowError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Workspace indexing failed, see log for details")]
    IndexingFailed,

    #[error("Invalid scenario file {path}: {message}")]
    Scenario { path: PathBuf, message: String },
}

/// CLI Configuration
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Workspace root directory
    pub project_root: PathBuf,

    /// Verbose output
    pub verbose: bool,

    /// Output format
    pub output_format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            verbose: false,
            output_format: OutputFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

/// Octo CLI
#[derive(Parser, Debug)]
#[command(name = "octo")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace root directory
    #[arg(short, long, global = true)]
    pub project_root: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum)]
    pub output: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Index the workspace for semantic search
    Index,

    /// Search the workspace index
    Search(SearchArgs),

    /// Manage saved sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),

    /// Inspect and apply staged file changes
    #[command(subcommand)]
    Shadow(ShadowCommand),

    /// Evaluate a saved session
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
pub(crate) struct SearchArgs {
    /// Search query
    pub query: String,

    /// Maximum number of results
    #[arg(short = 'k', long)]
    pub limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SessionsCommand {
    /// List saved sessions, newest first
    List,

    /// Show one session
    Show { session_id: String },

    /// Delete all but the newest sessions
    Cleanup {
        #[arg(long, default_value_t = DEFAULT_KEEP_SESSIONS)]
        keep: usize,
    },

    /// Export a session to a file
    Export { session_id: String, path: PathBuf },

    /// Import a session file
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug)]
pub(crate) enum ShadowCommand {
    /// List staged changes
    Status,

    /// Apply staged changes (all when no path is given)
    Commit { path: Option<String> },

    /// Drop staged changes (all when no path is given)
    Discard { path: Option<String> },
}

#[derive(Args, Debug)]
pub(crate) struct EvaluateArgs {
    /// Session to evaluate
    pub session_id: String,

    /// End-to-end scenario file (YAML or JSON); defaults to one derived from the session goal
    #[arg(long)]
    pub scenario: Option<PathBuf>,
}

/// 解析命令行并执行
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let output = run(cli).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// `RUST_LOG` 优先；否则 `--verbose` 为 debug，默认 warn
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    // 重复初始化 (测试中) 时忽略
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 执行命令，返回要打印的文本
pub(crate) async fn run(cli: Cli) -> Result<String, CliError> {
    let config = CliConfig {
        project_root: cli.project_root.unwrap_or_else(|| PathBuf::from(".")),
        verbose: cli.verbose,
        output_format: cli.output.unwrap_or(OutputFormat::Pretty),
    };
    debug!(root = %config.project_root.display(), command = ?cli.command, "Running command");

    match cli.command {
        Commands::Index => cmd_index(&config).await,
        Commands::Search(args) => cmd_search(args, &config).await,
        Commands::Sessions(command) => cmd_sessions(command, &config).await,
        Commands::Shadow(command) => cmd_shadow(command, &config).await,
        Commands::Evaluate(args) => cmd_evaluate(args, &config).await,
    }
}

/// 命令行没有生成能力；只用于索引与检索
struct NoGeneration;

#[async_trait]
impl GenerationCapability for NoGeneration {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        Err(ProviderError::InvalidRequest {
            message: "no generation capability is configured for the command line".to_string(),
        })
    }
}

fn workspace_agent(config: &CliConfig) -> Result<CoreAgent, CliError> {
    let octo = OctoConfig::load(&config.project_root)?;
    let context = AgentContext::new(
        &config.project_root,
        octo,
        Arc::new(NoGeneration),
        Arc::new(EnvCredentials),
    );
    Ok(CoreAgent::new(context, None, 0)?)
}

fn persistence(config: &CliConfig) -> SessionPersistence {
    SessionPersistence::new(&config.project_root)
}

async fn cmd_index(config: &CliConfig) -> Result<String, CliError> {
    info!(root = %config.project_root.display(), "Indexing workspace");
    let mut agent = workspace_agent(config)?;
    let report = agent.initialize_workspace().await.ok_or(CliError::IndexingFailed)?;

    Ok(match config.output_format {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Pretty => format!(
            "Indexed {} changed file(s), removed {} deleted file(s)\n{} chunk(s) added, {} total",
            report.changed_files, report.deleted_files, report.chunks_added, report.total_chunks
        ),
    })
}

async fn cmd_search(args: SearchArgs, config: &CliConfig) -> Result<String, CliError> {
    let mut agent = workspace_agent(config)?;
    agent.initialize_workspace().await.ok_or(CliError::IndexingFailed)?;

    let mut results = agent.search_workspace(&args.query).await?;
    if let Some(limit) = args.limit {
        results.truncate(limit);
    }

    if config.output_format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&results)?);
    }
    if results.is_empty() {
        return Ok(format!("No results for '{}'", args.query));
    }
    let sections: Vec<String> = results
        .iter()
        .map(|r| format!("[{:.3}] {}\n{}", r.score, r.path, indent(&r.chunk)))
        .collect();
    Ok(sections.join("\n\n"))
}

async fn cmd_sessions(command: SessionsCommand, config: &CliConfig) -> Result<String, CliError> {
    let store = persistence(config);
    match command {
        SessionsCommand::List => {
            let sessions = store.list_sessions().await?;
            if config.output_format == OutputFormat::Json {
                return Ok(serde_json::to_string_pretty(&sessions)?);
            }
            if sessions.is_empty() {
                return Ok("No saved sessions".to_string());
            }
            Ok(sessions
                .iter()
                .map(|s| format!("{}  {}  {}", s.session_id, s.timestamp.to_rfc3339(), s.goal))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        SessionsCommand::Show { session_id } => {
            let snapshot = load(&store, &session_id).await?;
            Ok(match config.output_format {
                OutputFormat::Json => serde_json::to_string_pretty(&snapshot)?,
                OutputFormat::Pretty => describe_session(&snapshot),
            })
        }
        SessionsCommand::Cleanup { keep } => {
            let removed = store.cleanup_old_sessions(keep).await?;
            Ok(format!("Removed {removed} session(s), kept at most {keep}"))
        }
        SessionsCommand::Export { session_id, path } => {
            if !store.export_session(&session_id, &path).await? {
                return Err(CliError::SessionNotFound(session_id));
            }
            Ok(format!("Exported {session_id} to {}", path.display()))
        }
        SessionsCommand::Import { path } => {
            let id = store.import_session(&path).await?;
            Ok(format!("Imported session as {id}"))
        }
    }
}

async fn load(store: &SessionPersistence, session_id: &str) -> Result<SessionSnapshot, CliError> {
    store
        .load_session(session_id)
        .await?
        .ok_or_else(|| CliError::SessionNotFound(session_id.to_string()))
}

fn describe_session(snapshot: &SessionSnapshot) -> String {
    let count = |kind: FlowEntryType| snapshot.flow.iter().filter(|e| e.entry_type == kind).count();
    let mut lines = vec![
        format!("Session: {}", snapshot.session_id),
        format!("Goal: {}", snapshot.goal),
        format!("Saved: {}", snapshot.timestamp.to_rfc3339()),
        format!(
            "Flow: {} entries ({} actions, {} observations, {} interventions)",
            snapshot.flow.len(),
            count(FlowEntryType::Action),
            count(FlowEntryType::Observation),
            count(FlowEntryType::HumanIntervention),
        ),
    ];
    match snapshot.test_history.last() {
        Some(last) => lines.push(format!(
            "Tests: {} run(s), last {} ({}/{} passed)",
            snapshot.test_history.len(),
            serde_json::to_value(last.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            last.passed_tests,
            last.total_tests
        )),
        None => lines.push("Tests: none".to_string()),
    }
    if let Some(metadata) = &snapshot.metadata {
        lines.push(format!("Iterations: {}", metadata.iterations));
        if let Some(tokens) = metadata.token_metrics {
            lines.push(format!(
                "Tokens: {} in, {} out, {} pruned over {} turn(s)",
                tokens.input, tokens.output, tokens.pruned, tokens.turns
            ));
        }
    }
    lines.join("\n")
}

async fn cmd_shadow(command: ShadowCommand, config: &CliConfig) -> Result<String, CliError> {
    let shadow = ShadowStore::new(&config.project_root);
    match command {
        ShadowCommand::Status => {
            let changes = shadow.staged_changes().await?;
            if changes.is_empty() {
                return Ok("No staged changes".to_string());
            }
            Ok(changes
                .iter()
                .map(|c| match c.kind {
                    StagedKind::Write => format!("M {}", c.path),
                    StagedKind::Delete => format!("D {}", c.path),
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ShadowCommand::Commit { path: Some(path) } => {
            let rel = shadow.normalize(&path)?;
            Ok(match shadow.commit(&path).await? {
                CommitOutcome::Written => format!("Committed {rel}"),
                CommitOutcome::Deleted => format!("Deleted {rel}"),
            })
        }
        ShadowCommand::Commit { path: None } => {
            let committed = shadow.commit_all().await?;
            if committed.is_empty() {
                return Ok("No staged changes to commit".to_string());
            }
            Ok(format!("Committed {} file(s):\n- {}", committed.len(), committed.join("\n- ")))
        }
        ShadowCommand::Discard { path: Some(path) } => {
            let rel = shadow.normalize(&path)?;
            Ok(if shadow.discard(&path).await? {
                format!("Discarded staged changes for {rel}")
            } else {
                format!("No staged changes for {rel}")
            })
        }
        ShadowCommand::Discard { path: None } => {
            let n = shadow.discard_all().await?;
            Ok(format!("Discarded {n} staged change(s)"))
        }
    }
}

async fn cmd_evaluate(args: EvaluateArgs, config: &CliConfig) -> Result<String, CliError> {
    let store = persistence(config);
    let session = load(&store, &args.session_id).await?;
    let scenario = match &args.scenario {
        Some(path) => read_scenario(path).await?,
        None => Evaluator::default_scenario_for(&session),
    };

    let result = Evaluator::new().evaluate_end_to_end(&scenario, &session);
    info!(session = %session.session_id, score = result.score, passed = result.passed, "Session evaluated");

    Ok(match config.output_format {
        OutputFormat::Json => serde_json::to_string_pretty(&result)?,
        OutputFormat::Pretty => describe_evaluation(&result),
    })
}

async fn read_scenario(path: &Path) -> Result<EndToEndScenario, CliError> {
    let invalid = |message: String| CliError::Scenario {
        path: path.to_path_buf(),
        message,
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))
}

fn describe_evaluation(result: &EvaluationResult) -> String {
    let mut lines = vec![format!(
        "Scenario {}: {:.0}% ({})",
        result.scenario_id,
        result.score,
        if result.passed { "PASSED" } else { "FAILED" }
    )];
    for detail in &result.details {
        let mark = if detail.passed { "x" } else { " " };
        match &detail.notes {
            Some(notes) => lines.push(format!("  [{mark}] {}: {notes}", detail.criterion)),
            None => lines.push(format!("  [{mark}] {}", detail.criterion)),
        }
    }
    lines.join("\n")
}

fn indent(text: &str) -> String {
    text.lines().map(|l| format!("    {l}")).collect::<Vec<_>>().join("\n")
}
