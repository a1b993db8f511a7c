use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use voxload_core::{LoadTestConfig, LoadTestReport, LoggingConfig, RunStatus};
use voxload_engine::{
    Connector, LoadProfileOrchestrator, MockEndpoint, MockEndpointConfig, ReportFormat,
    ReportWriter, RunAborted, SystemSampler, WebSocketConnector,
};

/// Exit code when `--fail-on-critical` is set and the report has critical issues.
const EXIT_CRITICAL: u8 = 2;
/// Exit code after Ctrl-C or SIGTERM.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "voxload")]
#[command(about = "Adaptive load tester for real-time audio streaming endpoints", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load test and write the report
    Run(RunArgs),

    /// Validate configuration and print the effective values as TOML
    CheckConfig {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(long, short, env = "VOXLOAD_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "VOXLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket endpoint, overrides endpoint.url
    #[arg(long)]
    endpoint: Option<String>,

    /// Maximum concurrent sessions, overrides load.max_concurrent_sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Run against the in-process mock endpoint instead of the network
    #[arg(long)]
    mock: bool,

    /// Mock endpoint response delay in milliseconds
    #[arg(long, default_value = "150", requires = "mock")]
    mock_response_ms: u64,

    /// Report file; printed to stdout when omitted
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Exit with code 2 when the report contains critical issues
    #[arg(long)]
    fail_on_critical: bool,

    /// Seed for profile and duration draws
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Markdown,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => ReportFormat::Json,
            OutputFormat::Markdown => ReportFormat::Markdown,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::CheckConfig { config } => check_config(config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "voxload failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<LoadTestConfig> {
    LoadTestConfig::load(path.map(PathBuf::as_path)).context("Failed to load configuration")
}

fn check_config(path: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(path.as_ref())?;
    print!("{}", config.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(endpoint) = &args.endpoint {
        config.endpoint.url = endpoint.clone();
    }
    if let Some(max_sessions) = args.max_sessions {
        config.load.max_concurrent_sessions = max_sessions;
    }
    config.validate().context("Invalid configuration after overrides")?;

    init_logging(&config.logging);

    let connector: Arc<dyn Connector> = if args.mock {
        info!(response_ms = args.mock_response_ms, "Using in-process mock endpoint");
        Arc::new(MockEndpoint::new(MockEndpointConfig {
            response_delay: Duration::from_millis(args.mock_response_ms),
            ..Default::default()
        }))
    } else {
        info!(url = %config.endpoint.url, "Using WebSocket endpoint");
        Arc::new(WebSocketConnector::new(&config.endpoint))
    };

    let mut orchestrator =
        LoadProfileOrchestrator::new(config, connector, Arc::new(SystemSampler::new()))?;
    if let Some(seed) = args.seed {
        orchestrator = orchestrator.with_seed(seed);
    }

    match orchestrator.run_until(shutdown_signal()).await {
        Ok(report) => {
            emit_report(&report, &args)?;
            if report.run_status == RunStatus::Interrupted {
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
            if args.fail_on_critical && report.has_critical_issues() {
                warn!(
                    critical_issues = report.critical_issues.len(),
                    "Critical issues found"
                );
                return Ok(ExitCode::from(EXIT_CRITICAL));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(RunAborted { error, report }) => {
            emit_report(&report, &args)?;
            Err(error).context("Load test aborted")
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM. A signal that cannot be installed never
/// fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl-C, ramping down and writing the report");
        }
        _ = terminate => {
            warn!("Received SIGTERM, ramping down and writing the report");
        }
    }
}

fn emit_report(report: &LoadTestReport, args: &RunArgs) -> Result<()> {
    let writer = ReportWriter::new(report);
    let format = ReportFormat::from(args.format);

    match &args.output {
        Some(path) => {
            writer
                .write(path, format)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", writer.render(format)?),
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},voxload_engine={level},voxload_core={level}",
            level = logging.level
        ))
    });

    // Logs go to stderr so a report on stdout stays parseable.
    if logging.format == "json" {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "voxload",
            "run",
            "--mock",
            "--max-sessions",
            "25",
            "--format",
            "markdown",
            "--fail-on-critical",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.mock);
        assert_eq!(args.max_sessions, Some(25));
        assert!(matches!(args.format, OutputFormat::Markdown));
        assert!(args.fail_on_critical);
        assert_eq!(args.mock_response_ms, 150);
    }

    #[test]
    fn test_mock_response_requires_mock() {
        let result = Cli::try_parse_from(["voxload", "run", "--mock-response-ms", "10"]);
        assert!(result.is_err());
    }
}
