use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "iamdb",
    about = "iamdb: RDS IAM authenticated MySQL connectivity",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign a fresh authentication token and print it
    Token {
        /// Settings file (iamdb.toml)
        #[arg(short, long)]
        config: PathBuf,
        /// Override the connection URL from the settings file
        #[arg(long)]
        url: Option<String>,
        /// Override the database user from the settings file
        #[arg(long)]
        username: Option<String>,
    },
    /// Open the pool, borrow a connection, ping it and close.
    ///
    /// Exercises the whole path: trust store, token, TLS handshake and
    /// cleartext-plugin login.
    Check {
        /// Settings file (iamdb.toml)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a trust store and keep it on disk for inspection
    TrustStore {
        /// Directory to write the store into
        #[arg(short, long)]
        out_dir: PathBuf,
        /// PEM root certificate (default: the embedded root)
        #[arg(long)]
        ca_file: Option<PathBuf>,
        /// Store integrity password
        #[arg(long, default_value = iamdb_pool::certificate::DEFAULT_STORE_PASSWORD)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays pipeable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("iamdb_pool=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Token {
            config,
            url,
            username,
        } => commands::token::token(&config, url, username).await,
        Commands::Check { config } => commands::check::check(&config).await,
        Commands::TrustStore {
            out_dir,
            ca_file,
            password,
        } => commands::trust_store::trust_store(&out_dir, ca_file, &password),
    }
}
