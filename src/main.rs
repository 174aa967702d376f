use clap::{Parser, Subcommand};
use std::path::PathBuf;

use review_rag::commands::{
    ask_question, consensus_review, review_diff, rereview_diff, show_status, sync_repository,
};
use review_rag::config::{Config, get_config_dir, show_config};

#[derive(Parser)]
#[command(name = "review-rag")]
#[command(about = "Retrieval-augmented code review over locally indexed repositories")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the local stores
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Clone or update a repository and bring its index up to date
    Sync {
        /// Repository name, e.g. "acme/widgets"
        full_name: String,
        clone_url: String,
        /// Branch, tag or commit to index
        #[arg(long, default_value = "HEAD")]
        rev: String,
        /// Access token for private repositories
        #[arg(long)]
        token: Option<String>,
    },
    /// Review a diff with the generator model
    Review {
        full_name: String,
        /// Unified diff of the change
        #[arg(long)]
        diff: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Print the review as JSON
        #[arg(long)]
        json: bool,
    },
    /// Review a diff with several models and synthesize their findings
    Consensus {
        full_name: String,
        #[arg(long)]
        diff: PathBuf,
        /// Committee models, defaults to llm.comparison_models
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check new changes against an earlier review
    Rereview {
        full_name: String,
        #[arg(long)]
        diff: PathBuf,
        /// File holding the earlier review
        #[arg(long)]
        original: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Ask a question about an indexed repository
    Ask { full_name: String, question: String },
    /// Show indexed repositories and their last scan
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    let config = Config::load(&config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config)?;
            } else {
                println!(
                    "Edit {} to change settings, or run with --show to print them.",
                    config.config_file_path().display()
                );
            }
        }
        Commands::Sync {
            full_name,
            clone_url,
            rev,
            token,
        } => {
            sync_repository(&config, &full_name, &clone_url, &rev, token.as_deref()).await?;
        }
        Commands::Review {
            full_name,
            diff,
            title,
            description,
            json,
        } => {
            review_diff(&config, &full_name, &diff, title, description, json).await?;
        }
        Commands::Consensus {
            full_name,
            diff,
            models,
            json,
        } => {
            consensus_review(&config, &full_name, &diff, models, json).await?;
        }
        Commands::Rereview {
            full_name,
            diff,
            original,
            json,
        } => {
            rereview_diff(&config, &full_name, &diff, &original, json).await?;
        }
        Commands::Ask {
            full_name,
            question,
        } => {
            ask_question(&config, &full_name, &question).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
    }

    Ok(())
}
