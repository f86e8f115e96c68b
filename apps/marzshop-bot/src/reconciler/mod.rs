pub mod jobs;

pub use jobs::{Job, JobReport, Reconciler};

use marzshop_db::utc_now;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

/// Runs every job on its own period until shutdown. A run that outlives
/// `job_timeout` is abandoned and the next tick starts fresh.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    job_timeout: Duration,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, job_timeout: Duration) -> Self {
        Self {
            reconciler,
            job_timeout,
        }
    }

    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        Job::ALL
            .into_iter()
            .map(|job| {
                let reconciler = self.reconciler.clone();
                let job_timeout = self.job_timeout;
                let rx = shutdown.subscribe();
                tokio::spawn(run_periodic(reconciler, job, job.period(), job_timeout, rx))
            })
            .collect()
    }
}

async fn run_periodic(
    reconciler: Arc<Reconciler>,
    job: Job,
    period: Duration,
    job_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(job = job.name(), ?period, "Starting background job");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                info!(job = job.name(), "Background job stopped");
                return;
            }
        }
        run_once(&reconciler, job, job_timeout).await;
    }
}

pub async fn run_once(reconciler: &Reconciler, job: Job, job_timeout: Duration) -> Option<JobReport> {
    match timeout(job_timeout, reconciler.run(job, utc_now())).await {
        Ok(Ok(report)) => {
            if report.processed > 0 || report.failed > 0 {
                info!(
                    job = job.name(),
                    processed = report.processed,
                    failed = report.failed,
                    "Job finished"
                );
            }
            Some(report)
        }
        Ok(Err(e)) => {
            error!(job = job.name(), "Job aborted: {:#}", e);
            None
        }
        Err(_) => {
            warn!(job = job.name(), ?job_timeout, "Job timed out");
            None
        }
    }
}
