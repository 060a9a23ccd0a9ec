use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use deepscan::{
    cache::Cache,
    checker::{
        risk_score, BatchPlanner, CircuitBreaker, DeviceCode, DeviceFlowAuthenticator,
        DeviceFlowClient, GithubAdvisoryClient, ResilientClient, StaticToken, TokenProvider,
    },
    config::Config,
    model::{ScanReport, Severity},
    orchestrator::Orchestrator,
    output::{format_report_to_string, print_report, OutputFormat},
    scanner::Discoverer,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit codes for CI integration
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const CRITICAL_VULN: u8 = 2;
    pub const HIGH_VULN: u8 = 3;
    pub const MEDIUM_VULN: u8 = 4;
    pub const LOW_VULN: u8 = 5;
    pub const ERROR: u8 = 1;
}

#[derive(Parser)]
#[command(name = "deepscan")]
#[command(
    author,
    version,
    about = "Scan dependency manifests across a source tree for known vulnerabilities"
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory tree for vulnerable dependencies
    Scan {
        /// Root directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Scan every project independently and report failures instead of
        /// stopping at the first one
        #[arg(long)]
        all: bool,

        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,

        /// Write output to file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit with error if advisories at or above this severity are found
        #[arg(long, value_enum)]
        fail_on: Option<FailLevel>,
    },

    /// Authenticate with GitHub using the device flow and save the token
    Login,

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FailLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl FailLevel {
    fn severity(self) -> Severity {
        match self {
            FailLevel::Critical => Severity::Critical,
            FailLevel::High => Severity::High,
            FailLevel::Medium => Severity::Medium,
            FailLevel::Low => Severity::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "deepscan=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = Config::load()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Scan {
            path,
            all,
            format,
            output,
            fail_on,
        } => {
            let format_str = format.unwrap_or_else(|| config.default_format.clone());
            let format = OutputFormat::from_str(&format_str).map_err(|e| anyhow::anyhow!(e))?;
            run_scan(&config, path, all, format, output, fail_on, &cancel).await
        }
        Commands::Login => {
            login(config, &cancel).await?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

fn device_flow(config: &Config) -> Result<DeviceFlowAuthenticator> {
    if config.auth.client_id.trim().is_empty() {
        bail!("auth.client_id is not set; add it to {}", Config::config_path().display());
    }

    let breaker = Arc::new(CircuitBreaker::new("github-auth", config.breaker.settings()));
    let client = DeviceFlowClient::new(
        &config.auth.base_url,
        &config.auth.client_id,
        &config.auth.scope,
        config.request_timeout(),
        breaker,
    )?;

    Ok(
        DeviceFlowAuthenticator::new(Arc::new(client), Cache::with_ttl(config.cache_ttl()))
            .with_prompt(|device: &DeviceCode| {
                eprintln!();
                eprintln!(
                    "To authorize deepscan, open {} and enter code {}",
                    device.verification_uri, device.user_code
                );
                eprintln!();
            }),
    )
}

/// Bearer token source: `GITHUB_TOKEN`, then the config file, then the
/// device flow when a client id is configured.
fn token_provider(config: &Config) -> Result<Option<Arc<dyn TokenProvider>>> {
    let provider: Arc<dyn TokenProvider> = if let Some(token) = config.static_token() {
        Arc::new(StaticToken::new(token))
    } else if config.auth.client_id.trim().is_empty() {
        tracing::warn!("no GitHub token configured, advisory queries are unauthenticated");
        return Ok(None);
    } else {
        Arc::new(device_flow(config)?)
    };
    Ok(Some(provider))
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let source = GithubAdvisoryClient::new(&config.advisory.base_url, config.request_timeout())?;
    let breaker = Arc::new(CircuitBreaker::new("github-advisories", config.breaker.settings()));
    let mut client = ResilientClient::new(Arc::new(source), breaker);
    if let Some(provider) = token_provider(config)? {
        client = client.with_token_provider(provider);
    }
    let client = Arc::new(client);
    let planner = BatchPlanner::new(client).with_batch_size(config.advisory.batch_size);

    Ok(Orchestrator::new(Discoverer::new(), planner)
        .with_max_concurrent(config.scan.max_concurrent_projects)
        .with_ignore(config.ignore.clone()))
}

async fn run_scan(
    config: &Config,
    path: PathBuf,
    all: bool,
    format: OutputFormat,
    output: Option<PathBuf>,
    fail_on: Option<FailLevel>,
    cancel: &CancellationToken,
) -> Result<u8> {
    let orchestrator = build_orchestrator(config)?;

    let spinner = if format == OutputFormat::Table && output.is_none() {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Scanning {}...", path.display()));
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let result = if all {
        orchestrator.scan_all(&path, cancel).await
    } else {
        orchestrator.scan_root(&path, cancel).await
    };

    if let Some(pb) = &spinner {
        match &result {
            Ok(report) => pb.finish_with_message(format!(
                "Scanned {} projects ({} failed)",
                report.succeeded.len() + report.failed.len(),
                report.failed.len()
            )),
            Err(_) => pb.finish_and_clear(),
        }
    }
    let report = result.with_context(|| format!("Scan of {} failed", path.display()))?;

    match output {
        Some(output_path) => {
            let content = format_report_to_string(&report, format)?;
            std::fs::write(&output_path, content)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            eprintln!("Report written to {}", output_path.display());
        }
        None => print_report(&report, format)?,
    }

    Ok(determine_exit_code(&report, fail_on))
}

/// Determine the exit code based on advisories found and --fail-on setting
fn determine_exit_code(report: &ScanReport, fail_on: Option<FailLevel>) -> u8 {
    let Some(level) = fail_on else {
        return exit_codes::SUCCESS;
    };

    let worst = report
        .succeeded
        .iter()
        .flat_map(|scan| scan.packages.iter())
        .map(|package| risk_score(package.severity))
        .max()
        .unwrap_or(0);

    if worst == 0 || worst < risk_score(level.severity()) {
        return exit_codes::SUCCESS;
    }

    match worst {
        4 => exit_codes::CRITICAL_VULN,
        3 => exit_codes::HIGH_VULN,
        2 => exit_codes::MEDIUM_VULN,
        _ => exit_codes::LOW_VULN,
    }
}

async fn login(mut config: Config, cancel: &CancellationToken) -> Result<()> {
    let authenticator = device_flow(&config)?;
    let token = authenticator
        .authenticate(cancel)
        .await
        .context("Device-flow login failed")?;

    config.advisory.token = Some(token.access_token);
    config.save()?;
    println!(
        "Logged in (scope: {}). Token saved to {}",
        if token.scope.is_empty() { "-" } else { &token.scope },
        Config::config_path().display()
    );
    Ok(())
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    // Show current config
    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'deepscan config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}
