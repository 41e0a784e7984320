use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use mend::cache::Cache;
use mend::config::{PipelineConfig, UserConfig};
use mend::eligibility::{check_eligibility, Eligibility};
use mend::git_ops;
use mend::history::{format_history, AttemptStore, JsonlAttemptStore};
use mend::llm::OpenRouterClient;
use mend::pipeline::{Capabilities, Pipeline, PipelineOutcome, PipelineReport};
use mend::publish::{DryRunPublisher, FixPublisher, GitPublisher};
use mend::signatures::extract_signatures;
use mend::source::{file_key_for, FsSource, GitSource, SourceFetcher};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "mend",
    about = "Generate, run, and self-heal test suites for changed source files",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate tests for files and heal them until they pass
    Run(RunArgs),
    /// Show eligibility and the signature inventory without calling a model
    Check(CheckArgs),
    /// Print the healing history of a file
    History(HistoryArgs),
    /// Store the OpenRouter API key in the system keychain
    Login(LoginArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Repository-relative source files
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Commit to read sources at (defaults to HEAD)
    #[arg(long = "ref")]
    reference: Option<String>,
    /// Pipeline config (defaults to <repo>/mend.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Never commit fixes or generated suites
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    file: PathBuf,
    #[arg(long, default_value = ".")]
    repo: PathBuf,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Read from stdin when omitted
    #[arg(long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mend=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args).await.map(|_| ExitCode::SUCCESS),
        Commands::History(args) => history(args).await.map(|_| ExitCode::SUCCESS),
        Commands::Login(args) => login(args).map(|_| ExitCode::SUCCESS),
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let repo = canonical_repo_path(&args.repo)?;
    let mut config = load_pipeline_config(&repo, args.config.as_deref())?;
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }

    let user_config = UserConfig::load();
    let model = OpenRouterClient::from_user_config(&user_config)?;

    let is_git = git_ops::head_commit(&repo).is_ok();
    // Pin once so every iteration of the loop reads the same commit.
    let reference = if is_git {
        Some(git_ops::resolve_commit(&repo, args.reference.as_deref().unwrap_or("HEAD"))?)
    } else if args.reference.is_some() {
        return Err(anyhow!("--ref requires {} to be a git repository", repo.display()));
    } else {
        None
    };

    let source: Arc<dyn SourceFetcher> = match &reference {
        Some(commit) => Arc::new(GitSource::new(&repo, commit.clone())),
        None => Arc::new(FsSource::new(&repo)),
    };
    let publisher: Arc<dyn FixPublisher> = if args.dry_run {
        Arc::new(DryRunPublisher)
    } else if is_git {
        Arc::new(GitPublisher::new(&repo))
    } else {
        warn!(repo = %repo.display(), "not a git repository, fixes will not be committed");
        Arc::new(DryRunPublisher)
    };

    let cache = Cache::new(&repo);
    let caps = Capabilities {
        source,
        model: Arc::new(model),
        store: Arc::new(JsonlAttemptStore::new(cache.clone())),
        publisher,
    };
    let pipeline = Pipeline::new(config, caps)?;

    let files = args
        .files
        .iter()
        .map(|file| repo_relative(&repo, file))
        .collect::<Result<Vec<_>>>()?;
    let run_id = Uuid::new_v4().to_string();
    info!(run_id = %run_id, files = files.len(), reference = ?reference, "run started");

    let report = pipeline.run_many(&run_id, &files, reference.as_deref()).await;
    persist_report(&cache, &report);
    print_report(&report);

    if report.failed + report.escalated + report.cancelled > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn check(args: CheckArgs) -> Result<()> {
    let repo = canonical_repo_path(&args.repo)?;
    let config = load_pipeline_config(&repo, args.config.as_deref())?;
    let source = FsSource::new(&repo);

    for file in &args.files {
        let relative = repo_relative(&repo, file)?;
        let unit = source.fetch(&relative, None).await?;
        match check_eligibility(&unit.path, &unit.content, &config.eligibility) {
            Eligibility::Eligible => {
                println!("{}: eligible", relative.display());
                let signatures = extract_signatures(&unit.content);
                if signatures.is_empty() {
                    println!("  (no exported functions detected)");
                }
                for signature in signatures {
                    println!("  {}", signature.describe());
                }
            }
            Eligibility::Skip(reason) => println!("{}: skipped ({})", relative.display(), reason),
        }
    }
    Ok(())
}

async fn history(args: HistoryArgs) -> Result<()> {
    let repo = canonical_repo_path(&args.repo)?;
    let relative = repo_relative(&repo, &args.file)?;
    let file_key = file_key_for(&relative);
    let store = JsonlAttemptStore::new(Cache::new(&repo));
    let attempts = store.load(&file_key).await?;
    print!("{}", format_history(&file_key, &attempts));
    Ok(())
}

fn login(args: LoginArgs) -> Result<()> {
    let key = match args.key {
        Some(key) => key,
        None => {
            eprintln!("Paste your OpenRouter API key and press enter:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read API key from stdin")?;
            line
        }
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("API key is empty"));
    }
    UserConfig::set_api_key(key)?;
    println!("API key saved to the system keychain.");

    // Write the effective settings so model ids can be edited in place.
    let user_config = UserConfig::load();
    match user_config.save() {
        Ok(()) => println!("Settings: {}", UserConfig::config_location()),
        Err(err) => warn!(error = %err, "could not write user config"),
    }
    Ok(())
}

fn load_pipeline_config(repo: &Path, explicit: Option<&Path>) -> Result<PipelineConfig> {
    let config = match explicit {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::discover(repo)?,
    };
    Ok(config)
}

fn canonical_repo_path(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("Repository path does not exist: {}", path.display()))
}

/// Accept paths relative to the repo or absolute paths inside it.
fn repo_relative(repo: &Path, file: &Path) -> Result<PathBuf> {
    if file.is_absolute() {
        let absolute = file
            .canonicalize()
            .with_context(|| format!("File does not exist: {}", file.display()))?;
        return absolute
            .strip_prefix(repo)
            .map(Path::to_path_buf)
            .map_err(|_| anyhow!("{} is outside {}", file.display(), repo.display()));
    }
    Ok(file.to_path_buf())
}

fn persist_report(cache: &Cache, report: &PipelineReport) {
    for file in &report.files {
        if let PipelineOutcome::Escalated { report: markdown } = &file.outcome {
            match cache.save_escalation(&file_key_for(&file.file), markdown) {
                Ok(path) => info!(file = %file.file.display(), path = %path.display(), "escalation report written"),
                Err(err) => warn!(file = %file.file.display(), error = %err, "failed to write escalation report"),
            }
        }
    }
    if let Err(err) = cache.save_run_report(&report.run_id, report) {
        warn!(run_id = %report.run_id, error = %err, "failed to write run report");
    }
}

fn print_report(report: &PipelineReport) {
    println!();
    for file in &report.files {
        let detail = match &file.outcome {
            PipelineOutcome::Passed { heal_attempts } => match heal_attempts {
                0 => "passed on first run".to_string(),
                n => format!("passed after {} healing attempt(s)", n),
            },
            PipelineOutcome::Skipped { reason } | PipelineOutcome::Failed { reason } => reason.clone(),
            PipelineOutcome::Escalated { .. } => "needs human review (see .mend/escalations/)".to_string(),
            PipelineOutcome::Cancelled => "cancelled".to_string(),
        };
        println!("{:<10} {}  {}", file.outcome.label(), file.file.display(), detail);
    }
    println!(
        "\n{} passed, {} skipped, {} failed, {} escalated",
        report.passed, report.skipped, report.failed, report.escalated
    );
    if let Some(usage) = &report.usage {
        println!("tokens: {} (${:.4})", usage.total_tokens, usage.cost());
    }
    println!("run: {}", report.run_id);
}
