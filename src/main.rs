//! CLI for PopQueue
//!
//! Subcommands:
//! - `bench`: publish a mixed-priority burst of jobs and work it off
//! - `purge`: drop every pending message for the configured prefix

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use tracing::{debug, error, info};

use popqueue::config::{Settings, load_config};
use popqueue::utils::logging;
use popqueue::worker::{InMemoryBackend, Outcome, Worker};
use popqueue::{Connection, PriorityLevel, QueueManager};

#[derive(Parser)]
#[command(name = "popqueue")]
enum Command {
    /// Publish a burst of jobs across all priorities and work them off
    Bench {
        /// Jobs to run immediately
        #[arg(long, default_value_t = 1000)]
        jobs: usize,
        /// Additional jobs scheduled in the future
        #[arg(long, default_value_t = 0)]
        deferred: usize,
        /// How far in the future deferred jobs run, in milliseconds
        #[arg(long, default_value_t = 500)]
        defer_ms: u64,
    },
    /// Drop every pending message for the configured prefix
    Purge,
}

fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Bench {
            jobs,
            deferred,
            defer_ms,
        } => run_bench(&settings, jobs, deferred, defer_ms),
        Command::Purge => run_purge(&settings),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

fn run_bench(
    settings: &Settings,
    jobs: usize,
    deferred: usize,
    defer_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = Connection::open(&settings.broker)?;
    let queue = Arc::new(QueueManager::new(&connection, &settings.queue)?);
    let backend = Arc::new(InMemoryBackend::new());
    let mut worker = Worker::new("bench", Arc::clone(&queue), Arc::clone(&backend));

    let now = Utc::now();
    let later = now + chrono::Duration::from_std(Duration::from_millis(defer_ms))?;
    let total = jobs + deferred;
    for i in 0..total {
        let priority = PriorityLevel::ALL[i % PriorityLevel::ALL.len()];
        let run_at = if i < jobs { now } else { later };
        let job = backend.create(format!("bench-{i}"), priority, run_at);
        worker.enqueue(&job)?;
    }
    info!(jobs, deferred, "published bench jobs");

    let started = Instant::now();
    let mut completed = 0;
    while completed < total {
        match worker.work_one(|_| Ok(()))? {
            Outcome::Completed => completed += 1,
            other => debug!(?other, "bench job not completed"),
        }
    }

    worker.throughput().report();
    info!(
        completed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "bench finished"
    );

    queue.shutdown();
    connection.close()?;
    Ok(())
}

fn run_purge(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let connection = Connection::open(&settings.broker)?;
    let queue = QueueManager::new(&connection, &settings.queue)?;
    let purged = queue.purge()?;
    info!(prefix = %queue.prefix(), purged, "purge complete");

    queue.shutdown();
    connection.close()?;
    Ok(())
}
