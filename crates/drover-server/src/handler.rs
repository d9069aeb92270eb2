//! Default job handler for queues declared in configuration.

use async_trait::async_trait;
use drover_queue::{JobContext, JobError, JobHandler};
use tracing::info;

/// Acknowledges every job after logging it.
///
/// Deployments embed `drover-queue` and register their own handlers; this
/// one lets the binary drain configured queues on its own, which is useful
/// for smoke tests and for inspecting traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        let payload = describe_payload(&ctx.payload);
        info!(
            queue = %ctx.queue,
            job_id = %ctx.job_id,
            priority = ctx.priority,
            attempt = ctx.attempt,
            payload = %payload,
            "Processed job"
        );
        Ok(())
    }
}

/// Renders a payload for logs: compact JSON, text, or a byte count.
fn describe_payload(payload: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        return value.to_string();
    }
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes>", payload.len()),
    }
}
