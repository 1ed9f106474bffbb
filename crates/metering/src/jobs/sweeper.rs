//! Periodic queue sweep.
//!
//! Recovers jobs whose eager trigger was lost by calling `process_one` a
//! bounded number of times per tick.

use super::Dispatcher;
use crate::config::DispatchConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Job sweeper that periodically drains the queue.
pub struct JobSweeper {
    dispatcher: Dispatcher,
    interval: Duration,
    max_jobs_per_tick: usize,
}

impl JobSweeper {
    pub fn new(dispatcher: Dispatcher, config: &DispatchConfig) -> Self {
        Self {
            dispatcher,
            interval: config.sweep_interval,
            max_jobs_per_tick: config.max_jobs_per_tick,
        }
    }

    /// Run a single sweep cycle. Returns the number of jobs processed.
    pub async fn sweep_once(&self) -> usize {
        match self.dispatcher.sweep(self.max_jobs_per_tick).await {
            Ok(processed) => processed,
            Err(e) => {
                error!("Sweep failed: {}", e);
                0
            }
        }
    }

    /// Run the sweeper indefinitely, sleeping between cycles.
    pub async fn run(&self) {
        info!(
            "Starting job sweeper, interval: {:?}, max jobs per tick: {}",
            self.interval, self.max_jobs_per_tick
        );

        loop {
            tokio::time::sleep(self.interval).await;

            let processed = self.sweep_once().await;
            if processed == 0 {
                debug!("No queued jobs this cycle");
            } else {
                info!("Sweep cycle complete: {} job(s) processed", processed);
            }
        }
    }
}

/// Spawn the job sweeper as a background task.
pub fn spawn_sweeper(
    dispatcher: Dispatcher,
    config: &DispatchConfig,
) -> tokio::task::JoinHandle<()> {
    let sweeper = Arc::new(JobSweeper::new(dispatcher, config));

    tokio::spawn(async move {
        sweeper.run().await;
    })
}
