use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clusterlab_core::config::{ConfigLoader, SandboxConfig};
use clusterlab_core::executors::SandboxRuntime;
use clusterlab_core::{
    CodeExecutionService, DockerRuntime, ExecutionEnvelope, ExecutionRequest, SecurityValidator,
};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;

const DEFAULT_CONFIG_FILE: &str = "clusterlab.yaml";

/// Process exit status for each kind of outcome.
const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_REJECTED: i32 = 2;

#[derive(Parser, Debug)]
#[clap(
    name = "clusterlab",
    author,
    version = "0.1.0",
    about = "Run untrusted clustering experiments in a locked-down container"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = DEFAULT_CONFIG_FILE,
        help = "Configuration file; missing default file means built-in defaults"
    )]
    config: PathBuf,

    #[clap(long, short, help = "Log level (overrides logging.level from the config)")]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[clap(long, short, conflicts_with = "code", help = "Read the snippet from a file")]
    file: Option<PathBuf>,

    #[clap(long, help = "Pass the snippet inline")]
    code: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a snippet and print the result envelope as JSON
    Run {
        #[clap(flatten)]
        source: SourceArgs,

        #[clap(long, help = "Timeout in seconds, capped by limits.max_timeout_secs")]
        timeout: Option<u64>,

        #[clap(long, help = "Algorithm name recorded in the harness")]
        algorithm: Option<String>,
    },
    /// Run only the static security checks
    Validate {
        #[clap(flatten)]
        source: SourceArgs,
    },
    /// Manage the sandbox image
    Image {
        #[clap(subcommand)]
        action: ImageCommands,
    },
    /// Remove orphaned containers and stale workspaces
    Reap {
        #[clap(long, help = "Minimum workspace age in seconds (default: workspace.stale_after_secs)")]
        max_age_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum ImageCommands {
    /// Build the image if it is missing
    Ensure,
    /// Show whether the daemon is reachable and the image exists
    Status,
    /// Build the image even if it exists
    Rebuild,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(&cli.config, dirs::config_dir().as_deref());
    let config = load_config(&cli.config, config_path.as_deref()).await?;
    init_logging(cli.log_level.as_deref(), &config)?;
    if let Some(path) = &config_path {
        log::debug!("Using configuration from {}", path.display());
    }

    let code = match cli.command {
        Commands::Run {
            source,
            timeout,
            algorithm,
        } => {
            let code = read_source(&source).await?;
            let mut request = ExecutionRequest::new(code);
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            if let Some(name) = algorithm {
                request = request.with_algorithm_hint(name);
            }
            run_snippet(config, request).await?
        }
        Commands::Validate { source } => {
            let code = read_source(&source).await?;
            validate_snippet(&config, &code)?
        }
        Commands::Image { action } => handle_image_command(&config, action).await?,
        Commands::Reap { max_age_secs } => {
            let service = CodeExecutionService::connect(config)?;
            let report = service.reap(max_age_secs.map(Duration::from_secs)).await?;
            println!(
                "{}",
                serde_json::json!({
                    "containers": report.containers,
                    "workspaces": report.workspaces,
                })
            );
            EXIT_SUCCESS
        }
    };

    std::process::exit(code);
}

/// The file to load, if any.
///
/// An explicitly named file is always used so a typo surfaces as an error.
/// The default name is looked up in the working directory first, then in the
/// per-user configuration directory.
fn resolve_config_path(requested: &Path, user_config_dir: Option<&Path>) -> Option<PathBuf> {
    if requested != Path::new(DEFAULT_CONFIG_FILE) || requested.exists() {
        return Some(requested.to_path_buf());
    }
    user_config_dir
        .map(|dir| dir.join("clusterlab").join(DEFAULT_CONFIG_FILE))
        .filter(|candidate| candidate.exists())
}

async fn load_config(requested: &Path, resolved: Option<&Path>) -> Result<SandboxConfig> {
    let config = match resolved {
        Some(path) => ConfigLoader::from_file(path).await,
        None => ConfigLoader::from_optional_file(requested).await,
    };
    Ok(config?)
}

fn init_logging(cli_level: Option<&str>, config: &SandboxConfig) -> Result<()> {
    let level = cli_level.unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);

    // stdout carries the JSON results; logs go to stderr or a file.
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level_filter);
    match &config.logging.file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(log_file)));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }
    builder.init();
    Ok(())
}

async fn read_source(source: &SourceArgs) -> Result<String> {
    if let Some(code) = &source.code {
        return Ok(code.clone());
    }
    if let Some(path) = &source.file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut code = String::new();
    tokio::io::stdin()
        .read_to_string(&mut code)
        .await
        .context("Failed to read the snippet from stdin")?;
    Ok(code)
}

async fn run_snippet(config: SandboxConfig, request: ExecutionRequest) -> Result<i32> {
    let service = CodeExecutionService::connect(config)?;
    let (envelope, code) = match service.execute(request).await {
        Ok(envelope) => {
            let code = exit_code_for(&envelope);
            (envelope, code)
        }
        Err(violation) => (ExecutionEnvelope::from(violation), EXIT_REJECTED),
    };
    println!("{}", envelope.to_json());
    Ok(code)
}

fn exit_code_for(envelope: &ExecutionEnvelope) -> i32 {
    if envelope.success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

fn validate_snippet(config: &SandboxConfig, code: &str) -> Result<i32> {
    let validator = SecurityValidator::new(&config.validator)?;
    match validator.validate(code) {
        Ok(()) => {
            println!("{}", serde_json::json!({ "valid": true }));
            Ok(EXIT_SUCCESS)
        }
        Err(violation) => {
            println!(
                "{}",
                serde_json::json!({
                    "valid": false,
                    "rule": violation.rule,
                    "token": violation.token,
                    "message": violation.message,
                })
            );
            Ok(EXIT_REJECTED)
        }
    }
}

async fn handle_image_command(config: &SandboxConfig, action: ImageCommands) -> Result<i32> {
    let runtime = DockerRuntime::new(config)?;
    match action {
        ImageCommands::Ensure => {
            runtime.ensure_image().await?;
            println!("Sandbox image {} is ready", runtime.image_tag());
        }
        ImageCommands::Status => {
            let available = runtime.is_available().await;
            let present = if available {
                Some(runtime.image_present().await?)
            } else {
                None
            };
            println!(
                "{}",
                serde_json::json!({
                    "daemon": available,
                    "tag": runtime.image_tag(),
                    "present": present,
                })
            );
            if present != Some(true) {
                return Ok(EXIT_FAILURE);
            }
        }
        ImageCommands::Rebuild => {
            runtime.rebuild_image().await?;
            println!("Sandbox image {} rebuilt", runtime.image_tag());
        }
    }
    Ok(EXIT_SUCCESS)
}
