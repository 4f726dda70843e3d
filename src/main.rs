use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cloudx::config::{CONFIG_FILE, CloudxConfig};
use cloudx::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "cloudx")]
#[command(version, about = "Collaborative development platform: dashboard, project API and workspaces")]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Keep data in memory instead of PostgreSQL
        #[arg(long)]
        in_memory: bool,

        /// Enable debug mode (permissive CORS, debug logging)
        #[arg(long)]
        debug: bool,
    },
    /// Create the database schema and exit
    InitDb,
    /// Print the effective configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = CloudxConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if let Commands::Serve {
        port, host, debug, ..
    } = &cli.command
    {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        config.server.debug |= *debug;
    }

    let level = if cli.verbose || config.server.debug {
        "debug"
    } else {
        "info"
    };
    init_logging(level, cli.log_format)?;

    match &cli.command {
        Commands::Serve { in_memory, .. } => cmd::cmd_serve(config, *in_memory).await?,
        Commands::InitDb => cmd::cmd_init_db(&config).await?,
        Commands::Config => cmd::cmd_config(&config)?,
    }

    Ok(())
}
