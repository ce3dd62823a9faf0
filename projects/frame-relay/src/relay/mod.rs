// Frame relay core: queue, dispatch state machine and worker process

pub mod dispatch;
pub mod queue;
pub mod service;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod fake;
