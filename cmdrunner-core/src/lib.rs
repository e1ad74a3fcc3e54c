pub mod config;
pub mod error;
pub mod models;
pub mod quoting;
pub mod transport;

pub use config::Config;
pub use error::{CmdRunnerError, Result};
pub use models::{ExecutionOutcome, JobRecord, Termination};
pub use quoting::{quote_all, quote_one};
pub use transport::{InMemoryTransport, JobTransport, DEFAULT_QUEUE};
