use std::sync::Arc;

use cmdrunner_core::{JobRecord, JobTransport, Result};
use tracing::info;

/// Producer side of the dispatch contract: serializes job records onto the
/// work queue and returns without waiting for execution.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn JobTransport>,
    queue: String,
}

impl Dispatcher {
    /// Declare `queue` on the transport and bind a dispatcher to it.
    pub async fn connect(transport: Arc<dyn JobTransport>, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        transport.declare_queue(&queue).await?;
        Ok(Self { transport, queue })
    }

    pub async fn dispatch(&self, job: &JobRecord) -> Result<()> {
        let body = job.to_bytes()?;
        self.transport.publish(&self.queue, body).await?;

        info!(
            queue = %self.queue,
            executable = %job.executable(),
            argument = %job.argument(),
            "job dispatched"
        );
        Ok(())
    }
}
