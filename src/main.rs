use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::{Result, eyre::WrapErr};
use portico::{
    config::{LogFormat, ServerConfigValidator, load_config, load_directory_source},
    supervisor, tracing_setup, worker,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[clap(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Format of the master's log output
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the master and its worker pool (default)
    Serve,
    /// Validate configuration and directory files
    Validate,
    /// Run one worker; spawned by the master
    #[clap(hide = true)]
    Worker {
        #[clap(long)]
        worker_id: u32,
    },
}

fn install_crypto_provider() {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}",
            e
        );
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    install_crypto_provider();

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => validate_config_command(&args.config),
        Commands::Worker { worker_id } => worker::run(worker_id, &args.config),
        Commands::Serve => serve_command(&args.config, args.log_format),
    }
}

fn serve_command(config_path: &Path, log_format: LogFormat) -> Result<()> {
    tracing_setup::init_master_tracing(log_format)?;
    let config = load_config(config_path)?;
    if let Err(e) = ServerConfigValidator::validate(&config) {
        return Err(e).wrap_err("Invalid configuration");
    }

    tracing::info!(
        workers = config.server.workers,
        port = config.server.port,
        https = config.server.https.as_ref().map(|h| h.port),
        "Starting portico"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to build master runtime")?;
    runtime.block_on(supervisor::run(config, config_path))
}

/// Validate configuration and directory files and exit
fn validate_config_command(config_path: &Path) -> Result<()> {
    println!("🔍 Validating configuration file: {}", config_path.display());

    if !config_path.exists() {
        eprintln!(
            "❌ Error: Configuration file '{}' not found",
            config_path.display()
        );
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = ServerConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    let directory = match load_directory_source(&config.directory.path) {
        Ok(directory) => directory,
        Err(e) => {
            eprintln!("❌ Directory parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = ServerConfigValidator::validate_directory(&directory) {
        eprintln!("❌ Directory validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Directory validation: OK");

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Workers: {}", config.server.workers);
    println!(
        "   • HTTP: port {} on {}",
        config.server.port,
        config.server.bind.join(", ")
    );
    match &config.server.https {
        Some(https) => println!("   • HTTPS: port {}", https.port),
        None => println!("   • HTTPS: disabled"),
    }
    println!("   • Retry on error: {}", config.server.retry_on_error);
    println!("   • Frontends: {}", directory.frontends.len());
    println!("   • SNI entries: {}", directory.sni.len());
    println!("   • Access log: {}", config.server.access_log.display());
    Ok(())
}
