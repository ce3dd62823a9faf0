use crate::relay::types::WorkerState;
use thiserror::Error;

/// Failures inside the relay core. None of these are fatal to the server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("worker is not running (state: {0})")]
    WorkerUnavailable(WorkerState),

    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process did not expose its {0} pipe")]
    MissingPipe(&'static str),

    #[error("worker input channel is busy")]
    InputBusy,

    #[error("worker input channel is closed")]
    InputClosed,

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("frame queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("dispatcher is not running")]
    DispatcherClosed,
}

pub type Result<T> = std::result::Result<T, RelayError>;
