mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coderun_common::config::RunnerConfig;
use coderun_common::questions::QuestionStore;
use coderun_common::redis::{RedisQueue, RedisSubmissionStore};
use coderun_common::spec::SpecResolver;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "coderun-cli")]
#[command(about = "coderun CLI - Inspect specs and questions, submit code, follow results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured languages and check that every alias resolves
    Specs,

    /// List available questions
    Questions,

    /// Submit a source file for execution
    Submit {
        /// Language key (aliases allowed)
        #[arg(short, long)]
        language: String,

        /// Source file to submit
        #[arg(short, long)]
        file: PathBuf,

        /// Question id to judge against (omit for a playground run)
        #[arg(short, long)]
        question: Option<String>,

        /// File piped to the program's stdin (playground only)
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Extra program arguments
        #[arg(short, long)]
        arg: Vec<String>,

        /// Wait for the verdict and print it
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Seconds to wait before giving up
        #[arg(long, default_value = "60")]
        wait_timeout: u64,
    },

    /// Show a submission
    Status {
        /// Submission id
        id: String,
    },

    /// Show the number of queued jobs
    Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = RunnerConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Specs => {
            let specs = SpecResolver::load(&config.spec_path)?;
            commands::list_specs(&specs)?;
        }
        Commands::Questions => {
            commands::list_questions(&QuestionStore::new(config.questions_dir.clone()))?;
        }
        Commands::Submit {
            language,
            file,
            question,
            stdin,
            arg,
            wait,
            wait_timeout,
        } => {
            let specs = SpecResolver::load(&config.spec_path)?;
            let questions = QuestionStore::new(config.questions_dir.clone());
            let client = redis_client(&config)?;
            let store = RedisSubmissionStore::connect(client.clone()).await?;
            let queue = RedisQueue::connect(client).await?;

            let id = commands::submit(
                &specs,
                &questions,
                &store,
                &queue,
                commands::SubmitArgs {
                    language: &language,
                    file: &file,
                    question: question.as_deref(),
                    stdin: stdin.as_deref(),
                    arguments: arg,
                },
            )
            .await?;
            println!("Submitted {}", id);

            if wait {
                let done = commands::wait_for(&store, &id, Duration::from_secs(wait_timeout)).await?;
                println!();
                commands::print_submission(&done);
            }
        }
        Commands::Status { id } => {
            let store = RedisSubmissionStore::connect(redis_client(&config)?).await?;
            commands::print_submission(&commands::fetch(&store, &id).await?);
        }
        Commands::Queue => {
            let queue = RedisQueue::connect(redis_client(&config)?).await?;
            println!("{} job(s) queued", commands::queue_depth(&queue).await?);
        }
    }

    Ok(())
}

fn redis_client(config: &RunnerConfig) -> Result<redis::Client> {
    redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))
}
