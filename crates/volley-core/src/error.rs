use thiserror::Error;

use crate::export::ExportError;

/// Boxed error handed back by attack-engine implementations.
pub type EngineFailure = Box<dyn std::error::Error + Send + Sync>;

/// Terminal errors of an attack run.
///
/// Storage write failures are not listed: the pipeline logs them and the run
/// goes on.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid target or options, raised before any I/O begins.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The attack engine could not start or failed while running.
    #[error("attack engine failed: {0}")]
    Engine(#[source] EngineFailure),

    /// The export run could not be opened.
    #[error("failed to start export run: {0}")]
    ExportStart(#[source] ExportError),

    /// A ledger row could not be written; the export run has been aborted.
    #[error("failed to export result: {0}")]
    ExportWrite(#[source] ExportError),

    /// Flushing, renaming or writing the summary failed at the end of the run.
    #[error("failed to finalize export: {0}")]
    ExportClose(#[source] ExportError),

    #[error("failed to create latency histogram: {0}")]
    Metrics(#[from] hdrhistogram::CreationError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn engine(err: impl Into<EngineFailure>) -> Self {
        Error::Engine(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
