//! Concurrency orchestrator for the repository loop.
//!
//! Fans one operation out over the full repository list on a bounded worker
//! pool, drives the live progress line, waits for every unit of work to
//! finish, and hands the completed report back for printing. Repositories
//! share no mutable state beyond the append-only report.

use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::ops::Operation;
use crate::report::{Outcome, Report};

/// Run `operation` over every configured repository and print the sorted
/// outcome table.
pub async fn run(operation: Operation, config: Arc<Configuration>, concurrency_flag: Option<usize>) {
    let report = collect(operation, config, concurrency_flag).await;
    report.print();
}

/// Run `operation` over every configured repository and return the report
/// without printing, so callers can merge further outcomes first.
///
/// This returns only after every queued repository has completed; the
/// report is quiescent from here on.
pub async fn collect(
    operation: Operation,
    config: Arc<Configuration>,
    concurrency_flag: Option<usize>,
) -> Arc<Report> {
    let workers = config.effective_concurrency(concurrency_flag);
    let deadline = match config.timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    debug!(
        "dispatching {} repositories across {} workers",
        config.repos.len(),
        workers
    );

    let semaphore = Arc::new(Semaphore::new(workers));
    let report = Arc::new(Report::new());
    let progress = progress_line(operation, config.repos.len());

    let mut tasks = FuturesUnordered::new();
    for repo in config.repos.iter().cloned() {
        let semaphore = Arc::clone(&semaphore);
        let config = Arc::clone(&config);
        let report = Arc::clone(&report);

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");

            match deadline {
                None => operation.run(&config, &repo, &report).await,
                Some(limit) => {
                    if timeout(limit, operation.run(&config, &repo, &report))
                        .await
                        .is_err()
                    {
                        // the cancelled future never reported, so the
                        // one-outcome-per-repository invariant is ours to keep
                        report.append(
                            &repo.dir,
                            Outcome::Error(format!("timed out after {}s", limit.as_secs())),
                        );
                    }
                }
            }
        }));
    }

    let total = config.repos.len();
    let mut done = 0usize;
    while let Some(joined) = tasks.next().await {
        if let Err(e) = joined {
            // one unit failing to report is a defect, not a reason to
            // abandon the remaining repositories
            warn!("repository task aborted: {}", e);
        }
        done += 1;
        progress.inc(1);
        debug!("{} ({}/{})", operation.progress_label(), done, total);
    }
    progress.finish_and_clear();

    report
}

/// The incrementally updating `N/M` line, hidden when stdout is not an
/// interactive terminal. When piped, the per-completion `debug!` lines in
/// [`collect`] keep progress observable under `-v`.
fn progress_line(operation: Operation, total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);

    if console::Term::stdout().is_term() {
        progress.set_style(
            ProgressStyle::with_template("{msg} ({pos}/{len})...")
                .expect("static progress template"),
        );
        progress.set_message(operation.progress_label());
    } else {
        progress.set_draw_target(ProgressDrawTarget::hidden());
    }

    progress
}
