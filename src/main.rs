use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{config::Config, schedule::Schedule, scrape_loop::RunControl};

mod checkpoint;
mod config;
mod duplicates;
mod fetcher;
mod output;
mod page_scrapers;
mod record;
mod schedule;
mod scrape_loop;
mod session;
#[cfg(test)]
mod test_support;


/// Scrapes Jobinja and Jobvision job postings into a CSV file.
///
/// While running, type `pause`, `resume`, `stop` or `status` and press enter.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Ignore the saved checkpoint and start from the first unit
    #[arg(long)]
    fresh: bool,
    /// Run once even when a schedule is configured
    #[arg(long)]
    once: bool
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!(site = config.site.name(), mode = config.mode.name(), output = %config.output.display(), "Loaded configuration");

    let control = Arc::new(RunControl::default());
    tokio::spawn(console(control.clone()));
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current unit");
                control.stop();
            }
        });
    }

    let scheduled = !args.once && config.schedule != Schedule::Immediate;
    let mut fresh = args.fresh;
    loop {
        control.begin();
        match session::run(&config, control.clone(), fresh).await {
            Ok(summary) => println!(
                "Finished ({:?}): {} records added, {} duplicates, {} placeholders",
                summary.outcome, summary.records_added, summary.duplicates, summary.placeholders
            ),
            Err(e) if scheduled => error!(error = %format!("{e:#}"), "Run failed, waiting for the next one"),
            Err(e) => return Err(e)
        }
        fresh = false;

        if !scheduled || control.is_stopped() {
            break;
        }
        let Some(delay) = config.schedule.next_delay(chrono::Local::now().naive_local()) else {
            break;
        };
        info!(minutes = delay.as_secs() / 60, "Waiting for the next scheduled run");
        if !wait_unless_stopped(&control, delay, config.pause_poll()).await {
            break;
        }
    }

    Ok(())
}


/// Reads operator commands from stdin until it closes.
async fn console(control: Arc<RunControl>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim().to_ascii_lowercase().as_str() {
            "" => {}
            "pause" => {
                control.pause();
                info!("Pausing after the current unit");
            }
            "resume" => control.resume(),
            "stop" => {
                control.stop();
                info!("Stopping after the current unit");
            }
            "status" => println!("{}", control.snapshot()),
            other => warn!(command = other, "Unknown command, expected pause, resume, stop or status")
        }
    }
}


/// Sleeps for `delay`, waking every `poll` to check for a stop. Returns `false` if one
/// was requested.
async fn wait_unless_stopped(control: &RunControl, delay: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    while tokio::time::Instant::now() < deadline {
        if control.is_stopped() {
            return false;
        }
        tokio::time::sleep(poll.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
    }
    !control.is_stopped()
}
