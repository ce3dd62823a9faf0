use crate::relay::dispatch::RestartPolicy;
use crate::relay::queue::{FrameQueue, OverflowPolicy};
use crate::relay::worker::{OutputFraming, WorkerConfig};
use clap::Parser;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, env = "FRAME_RELAY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, env = "FRAME_RELAY_PORT", default_value_t = 8088)]
    pub port: u16,

    /// How many successive ports to try if the first one is taken
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub port_attempts: u16,

    /// Detection worker executable
    #[arg(long, env = "FRAME_RELAY_WORKER", default_value = "python3")]
    pub worker: String,

    /// Argument passed to the worker (repeatable)
    #[arg(
        long = "worker-arg",
        env = "FRAME_RELAY_WORKER_ARGS",
        value_delimiter = ',',
        default_value = "py.py"
    )]
    pub worker_args: Vec<String>,

    /// How worker stdout is split into results
    #[arg(long, value_enum, default_value_t = OutputFraming::Chunk)]
    pub output_framing: OutputFraming,

    /// Maximum number of queued frames (unbounded when unset)
    #[arg(long, env = "FRAME_RELAY_QUEUE_CAPACITY")]
    pub queue_capacity: Option<NonZeroUsize>,

    /// What to do with a frame that does not fit in a bounded queue
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropOldest)]
    pub overflow: OverflowPolicy,

    /// Restart the worker at most this many times after it exits
    #[arg(long, env = "FRAME_RELAY_MAX_RESTARTS", default_value_t = 0)]
    pub max_restarts: u32,

    /// Delay before the first restart, doubled on each further attempt
    #[arg(long, default_value_t = 500)]
    pub restart_backoff_ms: u64,

    /// Upper bound on the restart delay
    #[arg(long, default_value_t = 30_000)]
    pub restart_backoff_max_ms: u64,

    /// Abandon a frame if the worker has not answered within this time
    #[arg(long, env = "FRAME_RELAY_RESULT_TIMEOUT_MS")]
    pub result_timeout_ms: Option<u64>,

    /// Detections buffered per client before a slow client starts skipping
    #[arg(long, default_value_t = NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN))]
    pub broadcast_capacity: NonZeroUsize,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program: self.worker.clone(),
            args: self.worker_args.clone(),
            framing: self.output_framing,
        }
    }

    pub fn frame_queue(&self) -> FrameQueue {
        match self.queue_capacity {
            Some(capacity) => FrameQueue::new(Some(capacity), self.overflow),
            None => FrameQueue::unbounded(),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            initial_backoff: Duration::from_millis(self.restart_backoff_ms),
            max_backoff: Duration::from_millis(self.restart_backoff_max_ms),
        }
    }

    pub fn result_timeout(&self) -> Option<Duration> {
        self.result_timeout_ms.map(Duration::from_millis)
    }
}
