use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pacer::config::PacerConfig;
use pacer::ratelimit::{
    Counters, ExponentialBackoff, LimiterOptions, RateLimiter, RateLimiterOptions, RetryPolicy,
};

/// Drive synthetic tasks through a rate limiter and report what happened.
#[derive(Parser, Debug)]
#[command(name = "pacer", version, about)]
struct Cli {
    /// Configuration file with limiter profiles
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profile to use from the configuration file
    #[arg(short, long, requires = "config")]
    profile: Option<String>,

    /// Ceiling on simultaneously running tasks
    #[arg(long)]
    max_concurrent: Option<f64>,

    /// Minimum spacing between task starts, in milliseconds
    #[arg(long)]
    delay_ms: Option<i64>,

    /// Ceiling on task starts within the interval
    #[arg(long)]
    max_calls_per_interval: Option<f64>,

    /// Length of the rolling interval, in milliseconds
    #[arg(long)]
    interval_ms: Option<i64>,

    /// Hold all admissions while a task serves its spacing delay
    #[arg(long)]
    pause_during_delay: bool,

    /// Use the semaphore engine
    #[arg(long)]
    alternate_engine: bool,

    /// Number of tasks to submit
    #[arg(short = 'n', long, default_value_t = 20)]
    tasks: u64,

    /// Duration of every attempt, in milliseconds
    #[arg(long, default_value_t = 100)]
    task_ms: u64,

    /// Probability that an attempt fails
    #[arg(long, default_value_t = 0.0)]
    fail_rate: f64,

    /// Attempts per task, including the first
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,

    /// First retry backoff, in milliseconds
    #[arg(long, default_value_t = 100)]
    backoff_ms: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Options given on the command line; unset flags stay unset.
    fn flag_options(&self) -> RateLimiterOptions {
        RateLimiterOptions {
            max_concurrent_calls: self.max_concurrent,
            delay_ms: self.delay_ms,
            max_calls_per_interval: self.max_calls_per_interval,
            interval_length_ms: self.interval_ms,
            start_paused: None,
            pause_during_delay: self.pause_during_delay.then_some(true),
            use_alternate_engine: self.alternate_engine.then_some(true),
        }
    }

    /// Flags layered over the selected profile, or over the file defaults.
    fn options(&self) -> anyhow::Result<RateLimiterOptions> {
        let Some(path) = &self.config else {
            return Ok(self.flag_options());
        };

        let config = PacerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        let base = match &self.profile {
            Some(name) => config.profile(name)?,
            None => config.defaults.clone(),
        };
        Ok(self.flag_options().merged_over(&base))
    }

    fn retry_policy(&self) -> RetryPolicy {
        if self.max_attempts <= 1 {
            return RetryPolicy::never();
        }

        RetryPolicy::max_attempts(self.max_attempts).with_delay(
            ExponentialBackoff {
                first: Duration::from_millis(self.backoff_ms),
                jitter: true,
                ..Default::default()
            }
            .into_delay_fn(),
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("task {task} failed on attempt {attempt}")]
struct SyntheticFailure {
    task: u64,
    attempt: u32,
}

#[derive(Debug, Serialize)]
struct Report {
    options: LimiterOptions,
    tasks: u64,
    succeeded: u64,
    failed: u64,
    elapsed_ms: u64,
    counters: Counters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Pacer v{}", env!("CARGO_PKG_VERSION"));

    if !(0.0..=1.0).contains(&cli.fail_rate) {
        bail!("--fail-rate must be between 0 and 1, got {}", cli.fail_rate);
    }

    let options = cli.options()?;
    let limiter = RateLimiter::with_retry(options, cli.retry_policy())
        .context("Failed to create rate limiter")?;
    info!(
        tasks = cli.tasks,
        engine = ?limiter.options().engine,
        "Submitting tasks"
    );

    let task_ms = cli.task_ms;
    let fail_rate = cli.fail_rate;
    let started = Instant::now();

    let tasks = (0..cli.tasks).map(|task| {
        let mut attempt = 0u32;
        move || {
            attempt += 1;
            let attempt = attempt;
            let fails = rand::thread_rng().gen_bool(fail_rate);
            async move {
                tokio::time::sleep(Duration::from_millis(task_ms)).await;
                if fails {
                    Err(SyntheticFailure { task, attempt })
                } else {
                    Ok(task)
                }
            }
        }
    });
    let outcomes = join_all(limiter.add_all(tasks)).await;

    let mut failed = 0;
    for outcome in &outcomes {
        if let Err(e) = outcome {
            warn!(error = %e, "Task gave up");
            failed += 1;
        }
    }

    let report = Report {
        options: limiter.options().clone(),
        tasks: cli.tasks,
        succeeded: cli.tasks - failed,
        failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        counters: limiter.counters(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} tasks in {} ms: {} succeeded, {} failed",
            report.tasks, report.elapsed_ms, report.succeeded, report.failed
        );
        println!(
            "attempts: {} total, {} done, {} failed, {} retries",
            report.counters.total,
            report.counters.done,
            report.counters.failed,
            report.counters.retries
        );
    }

    Ok(())
}
