//! Operator command line for redq applications.
//!
//! The application binary builds its [`Redq`] (declaring queues and
//! registering tasks) and hands it to [`run`], which parses the process
//! arguments and starts the requested component:
//!
//! ```rust,no_run
//! use redq::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> RedqResult<()> {
//!     let redq = Redq::new(RedqConfig::production()).await?;
//!     redq.queue("default").await;
//!     redq::cli::run(redq, None).await
//! }
//! ```

use crate::core::{Redq, Scheduler, WorkerEngine};
use crate::error::{RedqError, RedqResult};
use clap::{Parser, Subcommand};

/// redq operator commands.
#[derive(Debug, Clone, Parser)]
#[command(name = "redq")]
#[command(about = "Run redq workers, the periodic scheduler, or inspect queues")]
#[command(version)]
pub struct Cli {
    /// Component to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands of [`Cli`].
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a worker process until Ctrl+C or SIGTERM.
    Worker {
        /// Number of concurrent polling loops.
        #[arg(short = 'c', long, env = "REDQ_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Do not subscribe to broadcast tasks.
        #[arg(long)]
        no_broadcasts: bool,
    },

    /// Print queue depths, the ETA backlog and registered tasks as JSON.
    Info,

    /// Run the periodic scheduler until Ctrl+C or SIGTERM.
    Scheduler {
        /// Stay attached to the terminal.
        #[arg(short = 'f', long)]
        foreground: bool,
    },
}

/// Parse the process arguments and run the selected command.
pub async fn run(redq: Redq, scheduler: Option<Scheduler>) -> RedqResult<()> {
    execute(Cli::parse(), redq, scheduler).await
}

/// Run an already parsed command.
pub async fn execute(cli: Cli, redq: Redq, scheduler: Option<Scheduler>) -> RedqResult<()> {
    match cli.command {
        Command::Worker {
            concurrency,
            no_broadcasts,
        } => {
            let mut config = redq.config().worker.clone();
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if no_broadcasts {
                config.listen_broadcasts = false;
            }
            if config.concurrency == 0 {
                return Err(RedqError::config("Worker concurrency must be greater than 0"));
            }

            WorkerEngine::new(redq, config).run_until_signal().await
        }
        Command::Info => {
            let info = redq.info().await?;
            println!("{}", info.to_json()?);
            Ok(())
        }
        Command::Scheduler { foreground } => {
            let scheduler = scheduler.ok_or_else(|| {
                RedqError::config("This application does not define a periodic schedule")
            })?;

            if !foreground {
                tracing::warn!("Running in the background is not supported; staying attached");
            }

            scheduler.run_until_signal().await
        }
    }
}
