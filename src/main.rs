//! Warden - Governed LLM Gateway

use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden::safety::{Direction, SafetyScreener, ScanReport};
use warden::{config, Gateway, GatewayError, Server, NAME, VERSION};

/// Warden - Governed LLM Gateway
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "LLM gateway with safety screening, policy, budgets and provider failover")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "warden.yaml", env = "WARDEN_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run,

    /// Validate configuration file
    Validate,

    /// Show parsed configuration
    Config,

    /// Screen text and print findings plus the redacted text
    Scan {
        /// Text to scan, or `-` to read stdin
        text: String,

        /// Scan as provider output (skips jailbreak detection)
        #[arg(long)]
        output: bool,
    },
}

#[tokio::main]
async fn main() -> warden::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Some(Commands::Validate) => validate_config(&cli.config),
        Some(Commands::Config) => show_config(&cli.config),
        Some(Commands::Scan { text, output }) => scan(&cli.config, &text, output),
        Some(Commands::Run) | None => run_server(&cli.config).await,
    }
}

/// Initialize logging based on configuration
fn init_logging(level: &str, format: &str) -> warden::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={},audit={}", level, level)));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn run_server(config_path: &Path) -> warden::Result<()> {
    info!("Starting {} v{}", NAME, VERSION);

    let config = config::load_config(config_path)?;
    let address = config.server.address.clone();
    let max_body_size = config.server.max_body_size;

    let gateway = Arc::new(Gateway::from_config(config)?);
    let server = Server::bind(gateway, &address, max_body_size).await?;
    server.run(warden::server::shutdown_signal()).await
}

fn validate_config(config_path: &Path) -> warden::Result<()> {
    println!("Validating configuration: {:?}", config_path);

    let config = config::load_config(config_path)?;

    println!("Configuration is valid!");
    println!("  Listen address: {}", config.server.address);
    println!("  Providers: {}", config.providers.len());
    println!(
        "  Default provider: {}",
        config.routing.default_provider.as_deref().unwrap_or("-")
    );
    println!("  Fallbacks: {:?}", config.routing.fallback_providers);
    println!("  Cache: {}", if config.cache.enabled { "on" } else { "off" });
    println!(
        "  Policy: {}",
        if config.policy.enabled {
            config.policy.url.as_deref().unwrap_or("-")
        } else {
            "disabled"
        }
    );

    Ok(())
}

fn show_config(config_path: &Path) -> warden::Result<()> {
    let config = config::load_config(config_path)?;
    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize config: {}", e)))?;
    println!("{}", yaml);
    Ok(())
}

/// Uses the config's safety section when the file exists, defaults otherwise
fn scan(config_path: &Path, text: &str, output: bool) -> warden::Result<()> {
    let safety = if config_path.exists() {
        config::load_config(config_path)?.safety
    } else {
        Default::default()
    };

    let text = if text == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        text.to_string()
    };

    let direction = if output {
        Direction::Output
    } else {
        Direction::Input
    };
    let screener = SafetyScreener::new(safety);
    let findings = screener.scan(&text, direction);
    let report = ScanReport::new(findings.clone());

    let result = serde_json::json!({
        "direction": direction,
        "max_severity": report.max_severity(),
        "blocking": report.is_blocking(),
        "findings": findings,
        "redacted": screener.sanitize(&text, direction),
    });
    let pretty = serde_json::to_string_pretty(&result)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize findings: {}", e)))?;
    println!("{}", pretty);
    Ok(())
}
