use clap::{Parser, Subcommand};
use log::info;
use portico::config::Config;
use portico::Router;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "A connection router for database servers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/portico.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_router(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_router(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);

    info!("Starting portico v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Configured routes: {}", config.routes.len());

    let mut router = Router::new();
    router.add_routes_from_config(&config)?;
    router.start().await?;

    info!("All routes started; waiting for Ctrl-C");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    router.stop().await;
    let stats = router.stats();
    info!(
        "Stopped after {} accepted connections across {} routes",
        stats.total_accepted,
        stats.routes.len()
    );

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating example configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portico run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Routes: {}", config.routes.len());
            for (name, route) in &config.routes {
                let mode = &route.mode;
                let protocol = route.protocol.as_deref().unwrap_or("classic");
                println!("    routing:{}: {} ({})", name, mode, protocol);
                println!("      destinations: {}", route.destinations);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            eprintln!("  {}", e);
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("portico v{}", env!("CARGO_PKG_VERSION"));
    println!("A connection router for database servers");
    println!();
    println!("Features:");
    println!("  • Classic and extended wire-protocol framing");
    println!("  • Static CSV and metadata-cache destination sets");
    println!("  • Per-route connection limits and client blacklisting");
    println!("  • TCP and local-domain socket listeners");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("Logging initialized at level: {:?}", log_level);
}
