//! Process execution and the job-consuming worker loop.

pub mod executor;
pub mod process;
pub mod shutdown;
pub mod worker;

pub use executor::ProcessExecutor;
pub use process::ExecuteRequest;
pub use shutdown::install_shutdown_handler;
pub use worker::{LogSink, OutcomeSink, Worker, WorkerOptions};
