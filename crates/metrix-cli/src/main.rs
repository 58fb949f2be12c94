//! CLI for metrix: run the collector or the agent.

mod commands;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "metrix")]
#[command(about = "metrix: push-based runtime and system metrics")]
#[command(version = metrix_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP collector
    Server {
        /// Listen address (host:port)
        #[arg(short = 'a', long, env = "ADDRESS", default_value = metrix_core::config::DEFAULT_ADDR)]
        address: String,

        /// Seconds between snapshot flushes; 0 flushes after every write
        #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value_t = 300)]
        store_interval: u64,

        /// Snapshot file for the in-memory store; empty disables persistence
        #[arg(short = 'f', long, env = "FILE_STORAGE_PATH", default_value = "./metrix.json")]
        file_storage_path: String,

        /// Load the snapshot file on startup
        #[arg(short = 'r', long, env = "RESTORE", default_value_t = true, action = ArgAction::Set)]
        restore: bool,

        /// SQLite DSN; selects the database backend when set
        #[arg(short = 'd', long, env = "DATABASE_DSN")]
        database_dsn: Option<String>,

        /// HMAC-SHA256 key for request and response signatures
        #[arg(short = 'k', long, env = "KEY")]
        key: Option<String>,

        /// Hex AES key (16 or 32 bytes) for body encryption
        #[arg(long, env = "CRYPTO_KEY")]
        crypto_key: Option<String>,
    },

    /// Sample this host and push metrics to a collector
    Agent {
        /// Collector address (host:port)
        #[arg(short = 'a', long, env = "ADDRESS", default_value = metrix_core::config::DEFAULT_ADDR)]
        address: String,

        /// Seconds between samples
        #[arg(short = 'p', long, env = "POLL_INTERVAL", default_value_t = 2)]
        poll_interval: u64,

        /// Seconds between reports
        #[arg(short = 'r', long, env = "REPORT_INTERVAL", default_value_t = 10)]
        report_interval: u64,

        /// Maximum concurrent reports; 0 means unlimited
        #[arg(short = 'l', long, env = "RATE_LIMIT", default_value_t = 0)]
        rate_limit: usize,

        /// HMAC-SHA256 key for request signatures
        #[arg(short = 'k', long, env = "KEY")]
        key: Option<String>,

        /// Hex AES key (16 or 32 bytes) for body encryption
        #[arg(long, env = "CRYPTO_KEY")]
        crypto_key: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Server {
            address,
            store_interval,
            file_storage_path,
            restore,
            database_dsn,
            key,
            crypto_key,
        } => commands::server::run(commands::server::ServerArgs {
            address,
            store_interval,
            file_storage_path,
            restore,
            database_dsn,
            key,
            crypto_key,
        }),
        Commands::Agent {
            address,
            poll_interval,
            report_interval,
            rate_limit,
            key,
            crypto_key,
        } => commands::agent::run(commands::agent::AgentArgs {
            address,
            poll_interval,
            report_interval,
            rate_limit,
            key,
            crypto_key,
        }),
    };

    if let Err(e) = outcome {
        log::error!(target: "metrix", "{e}");
        std::process::exit(1);
    }
}
