//! Judgebox CLI
//!
//! Grades submission batches, serves sandboxes to remote graders and runs
//! single programs in an isolate box.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use judgebox::protocol::{CompileRequest, TestRequest};
use judgebox::submission::CONSOLE_STEM;
use judgebox::{
    BoxManager, Config, DiskStorage, EXAMPLE_CONFIG, EvalClient, EvalServer, Evaluator, Grader,
    ManagerPool, MemoryStore, Submission, TestLimits, TestStorage,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Submission id used for one-off compiles and runs
const SCRATCH_SUBMISSION: u64 = 0;

#[derive(Parser)]
#[command(name = "judgebox")]
#[command(about = "Sandboxed grading of programming-contest submissions")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: judgebox.toml)
        #[arg(short, long, default_value = "judgebox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Grade a JSON batch of submissions and print the results
    Grade {
        /// JSON array of submissions with their tests
        #[arg(value_name = "BATCH")]
        batch: PathBuf,

        /// Grade on remote workers instead of local boxes (repeatable)
        #[arg(short, long, value_name = "ADDR")]
        remote: Vec<String>,

        /// Submissions graded at once on each remote worker
        /// (default: the configured box count)
        #[arg(short = 'j', long, value_name = "N")]
        jobs: Option<usize>,
    },

    /// Serve local boxes to remote graders
    Worker {
        /// Address to listen on (default: from configuration)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Compile source code
    Compile {
        /// Source file to compile
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., cpp17, rust, go)
        #[arg(short, long)]
        language: String,

        /// Box ID to use
        #[arg(short = 'b', long, default_value = "0")]
        box_id: u32,
    },

    /// Compile if needed, then run a program on console input
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., cpp17, python3)
        #[arg(short, long)]
        language: String,

        /// Input file (default: empty input)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Time limit in seconds
        #[arg(short, long)]
        time_limit: Option<f64>,

        /// Memory limit in KB
        #[arg(short, long)]
        memory_limit: Option<u64>,

        /// Box ID to use
        #[arg(short = 'b', long, default_value = "0")]
        box_id: u32,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };
    let config = Arc::new(config);

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Grade {
            batch,
            remote,
            jobs,
        } => grade(config, &batch, remote, jobs).await,
        Commands::Worker { listen } => worker(config, listen).await,
        Commands::Compile {
            source,
            language,
            box_id,
        } => run_compile(config, box_id, &source, &language).await,
        Commands::Run {
            source,
            language,
            input,
            time_limit,
            memory_limit,
            box_id,
        } => {
            let limits = TestLimits {
                time_limit: time_limit.unwrap_or_default(),
                memory_limit: memory_limit.unwrap_or_default(),
                stack_limit: 0,
            };
            run_program(config, box_id, &source, &language, input.as_deref(), limits).await
        }
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

/// A token cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
        trigger.cancel();
    });
    cancel
}

fn test_storage(config: &Config) -> Arc<dyn TestStorage> {
    Arc::new(DiskStorage::new(config.storage.data_dir.clone()))
}

async fn grade(
    config: Arc<Config>,
    batch: &Path,
    remote: Vec<String>,
    jobs: Option<usize>,
) -> Result<()> {
    let content = tokio::fs::read(batch)
        .await
        .with_context(|| format!("failed to read batch {}", batch.display()))?;
    let submissions: Vec<Submission> =
        serde_json::from_slice(&content).context("failed to parse batch")?;
    info!(submissions = submissions.len(), "batch loaded");

    let storage = test_storage(&config);
    let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::new();
    if remote.is_empty() {
        for id in config.grader.box_ids() {
            let manager = BoxManager::new(id, Arc::clone(&config), Arc::clone(&storage))
                .await
                .with_context(|| format!("failed to start box {id}"))?;
            evaluators.push(Arc::new(Arc::new(manager)));
        }
    } else {
        let jobs = jobs.unwrap_or(config.grader.box_count as usize);
        evaluators = remote_evaluators(remote, jobs);
    }

    let store = MemoryStore::new(submissions);
    let grader = Grader::new(
        Arc::new(store.clone()),
        storage,
        evaluators,
        config.grader.clone(),
    );
    let cancel = shutdown_token();
    let grading = tokio::spawn(grader.run(cancel.clone()));

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if store.all_done() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    grading.await.context("grader task failed")?;

    let results = serde_json::to_string_pretty(&store.snapshot())?;
    println!("{results}");
    Ok(())
}

/// `jobs` dispatchers per worker address; each call opens its own connection
fn remote_evaluators(addrs: Vec<String>, jobs: usize) -> Vec<Arc<dyn Evaluator>> {
    let jobs = jobs.max(1);
    let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::with_capacity(addrs.len() * jobs);
    for addr in addrs {
        info!(%addr, jobs, "grading on remote worker");
        let client: Arc<dyn Evaluator> = Arc::new(EvalClient::new(addr));
        evaluators.extend(std::iter::repeat_n(client, jobs));
    }
    evaluators
}

async fn worker(config: Arc<Config>, listen: Option<SocketAddr>) -> Result<()> {
    let addr = listen.unwrap_or(config.worker.listen);
    let pool = ManagerPool::new(Arc::clone(&config), test_storage(&config))
        .await
        .context("failed to start box managers")?;
    let server = EvalServer::bind(addr, Arc::new(pool))
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;

    server.run(shutdown_token()).await;
    Ok(())
}

async fn read_source(source: &Path) -> Result<String> {
    let bytes = tokio::fs::read(source)
        .await
        .context("failed to read source file")?;
    String::from_utf8(bytes).context("source file is not valid UTF-8")
}

async fn run_compile(config: Arc<Config>, box_id: u32, source: &Path, language_id: &str) -> Result<()> {
    let language = config
        .get_language(language_id)
        .context("unknown language")?
        .clone();
    if !language.is_compiled() {
        println!("Language '{}' does not require compilation", language.name);
        return Ok(());
    }
    let code = read_source(source).await?;

    info!(language = %language.name, "compiling source");
    let manager = BoxManager::new(box_id, Arc::clone(&config), test_storage(&config))
        .await
        .context("failed to acquire sandbox")?;
    let result = manager.compile(code.as_bytes(), &language).await;
    manager.cleanup().await;

    match result {
        Ok(output) => {
            println!("Compilation successful");
            if !output.is_empty() {
                println!("\nCompiler output:\n{output}");
            }
            Ok(())
        }
        Err(judgebox::CompileError::Failed { output }) => {
            println!("Compilation failed");
            if !output.is_empty() {
                println!("\nCompiler output:\n{output}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e).context("compilation could not run"),
    }
}

async fn run_program(
    config: Arc<Config>,
    box_id: u32,
    source: &Path,
    language_id: &str,
    input: Option<&Path>,
    limits: TestLimits,
) -> Result<()> {
    config
        .get_language(language_id)
        .context("unknown language")?;
    let code = read_source(source).await?;
    let input = match input {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .context("failed to read input file")?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        None => String::new(),
    };

    let manager = BoxManager::new(box_id, Arc::clone(&config), test_storage(&config))
        .await
        .context("failed to acquire sandbox")?;

    let compiled = manager
        .compile_submission(CompileRequest {
            submission_id: SCRATCH_SUBMISSION,
            language: language_id.to_owned(),
            code,
        })
        .await;
    if !compiled.success {
        manager.cleanup().await;
        eprintln!("Compilation failed:");
        eprintln!("{}", compiled.output);
        if !compiled.other.is_empty() {
            eprintln!("{}", compiled.other);
        }
        std::process::exit(1);
    }

    info!("executing program");
    let response = manager
        .execute_test(TestRequest {
            test_id: 0,
            submission_id: SCRATCH_SUBMISSION,
            language: language_id.to_owned(),
            input,
            output_stem: CONSOLE_STEM.to_owned(),
            limits,
        })
        .await;
    if let Err(e) = manager.remove_artifact(SCRATCH_SUBMISSION).await {
        warn!(error = %e, "failed to remove compiled artifact");
    }
    manager.cleanup().await;

    print!("{}", response.output);

    // Execution info goes to stderr, keeping stdout clean for piping
    info!(
        status = ?response.status,
        time = format_args!("{:.3}s", response.time),
        memory = format_args!("{} KB", response.memory),
        comments = %response.comments,
        "execution result"
    );

    if response.status == judgebox::TestStatus::Ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!("  {:<15} {} ({})", id, lang.name, lang_type);
    }
}

fn show_config(config: &Config) {
    let grader = &config.grader;
    println!("Grader:");
    println!("  Poll interval: {:?}", grader.poll_interval());
    println!(
        "  Queues: {} tasks, {} updates",
        grader.task_queue_size, grader.update_queue_size
    );
    println!(
        "  Boxes: {} starting at id {}",
        grader.box_count, grader.first_box_id
    );
    println!("  Reset retries: {}", grader.reset_retries);
    println!(
        "  Wall time: limit + {}s, {}s without a limit",
        grader.wall_time_margin, grader.wall_time_ceiling
    );
    println!("  Compile time limit: {:?}", grader.compile_limits.time_limit);
    println!(
        "  Compile memory limit: {:?} KB",
        grader.compile_limits.memory_limit
    );
    println!();
    println!("Isolate binary: {}", config.isolate_binary().display());
    println!("Cgroup: {}", config.cgroup);
    println!("Test data: {}", config.storage.data_dir.display());
    println!("Compile cache: {}", config.storage.compile_dir.display());
    println!("Worker address: {}", config.worker.listen);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
