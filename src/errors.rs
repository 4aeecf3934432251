use thiserror::Error;
use tracing::error;

/// Failures that end a parsing run. Individual record failures never show up
/// here; they are logged and the record is skipped.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to prepare history builder: {0}")]
    Prepare(#[source] anyhow::Error),

    #[error("Parser '{parser}' faulted on log record {record_index}: {message}")]
    ParserFault {
        parser: String,
        record_index: usize,
        message: String,
    },

    #[error("Group worker terminated abnormally: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Sink for faults that should not happen in a correct program.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &str, metadata: &[(&str, &str)]);
}

/// Reports faults as `error!` events.
#[derive(Debug, Default, Clone)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &str, metadata: &[(&str, &str)]) {
        let metadata = metadata
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        error!("Unrecoverable fault: {} [{}]", err, metadata);
    }
}

/// Turn a panic payload into something printable.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
