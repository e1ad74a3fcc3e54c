//! Consumer side of the dispatch contract.
//!
//! A [`Worker`] pulls job records off a named queue and runs each one in its
//! own task through the [`ProcessExecutor`]. Messages count as consumed once
//! received, so a job that later fails or times out is not redelivered.

use std::sync::Arc;
use std::time::Duration;

use cmdrunner_core::config::{BrokerConfig, WorkerConfig};
use cmdrunner_core::{ExecutionOutcome, JobRecord, JobTransport, Result, DEFAULT_QUEUE};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::ProcessExecutor;
use crate::process::ExecuteRequest;

/// Receives the outcome of every job that ran.
pub trait OutcomeSink: Send + Sync {
    fn report(&self, job: &JobRecord, outcome: &ExecutionOutcome);
}

/// Writes the reported text of each outcome to stdout.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn report(&self, job: &JobRecord, outcome: &ExecutionOutcome) {
        info!(
            executable = %job.executable(),
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out(),
            "job outcome"
        );
        println!("{}", outcome.report_text());
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    pub job_timeout: Duration,
    pub kill_grace: Duration,
    pub max_concurrent_jobs: Option<usize>,
    pub retry_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            job_timeout: Duration::from_secs(3600),
            kill_grace: Duration::from_secs(2),
            max_concurrent_jobs: None,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(broker: &BrokerConfig, worker: &WorkerConfig) -> Self {
        Self {
            queue: broker.queue.clone(),
            job_timeout: worker.job_timeout(),
            kill_grace: worker.kill_grace(),
            max_concurrent_jobs: worker.concurrency_limit(),
            retry_backoff: worker.retry_backoff(),
        }
    }
}

pub struct Worker {
    transport: Arc<dyn JobTransport>,
    sink: Arc<dyn OutcomeSink>,
    executor: ProcessExecutor,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        sink: Arc<dyn OutcomeSink>,
        options: WorkerOptions,
    ) -> Self {
        let executor = ProcessExecutor::new().with_kill_grace(options.kill_grace);
        Self {
            transport,
            sink,
            executor,
            options,
        }
    }

    /// Consume jobs until `shutdown` fires or the transport closes.
    ///
    /// On shutdown, running processes are cancelled through the executor's
    /// kill path; either way all in-flight jobs are awaited before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = self.options.queue.as_str();
        self.transport.declare_queue(queue).await?;
        info!(queue, "waiting for messages");

        let limit = self
            .options
            .max_concurrent_jobs
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut jobs = JoinSet::new();

        loop {
            let permit = match &limit {
                Some(semaphore) => {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }
                None => None,
            };

            while let Some(joined) = jobs.try_join_next() {
                log_join(joined);
            }

            // Only shutdown may interrupt a receive; a dropped long-poll can
            // lose a message the broker already handed out.
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.transport.receive(queue) => received,
            };

            match received {
                Ok(Some(body)) => {
                    let executor = self.executor.clone();
                    let sink = self.sink.clone();
                    let timeout = self.options.job_timeout;
                    let cancel = shutdown.child_token();
                    let execution_id = Uuid::new_v4();

                    jobs.spawn(
                        async move {
                            let _permit = permit;
                            run_delivery(&body, &executor, sink.as_ref(), timeout, &cancel).await;
                        }
                        .instrument(info_span!("job", %execution_id)),
                    );
                }
                Ok(None) => {
                    info!(queue, "transport closed");
                    break;
                }
                Err(e) => {
                    warn!(queue, error = %e, "receive failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.retry_backoff) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "waiting for running jobs");
        }
        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }

        info!(queue, "worker stopped");
        Ok(())
    }
}

/// Decode one delivery, run it and report the outcome.
///
/// Every failure is logged here; nothing escapes to the receive loop.
pub async fn run_delivery(
    body: &[u8],
    executor: &ProcessExecutor,
    sink: &dyn OutcomeSink,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<ExecutionOutcome> {
    let job = match JobRecord::from_bytes(body) {
        Ok(job) => job,
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(body),
                "dropping malformed job"
            );
            return None;
        }
    };

    let request = ExecuteRequest::for_job(&job, timeout);
    info!(command = %request.display(), "received job");

    match executor.execute(&request, cancel).await {
        Ok(outcome) => {
            sink.report(&job, &outcome);
            Some(outcome)
        }
        Err(e) => {
            error!(executable = %job.executable(), error = %e, "job execution failed");
            None
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job task panicked");
    }
}
