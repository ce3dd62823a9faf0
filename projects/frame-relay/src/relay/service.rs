// Dispatcher task: the single owner of the queue, the in-flight flag and the worker
//
// Commands from the gateway, worker events and timers are all funnelled into
// one task and handled one at a time, so no locking is needed.

use crate::error::{RelayError, Result};
use crate::relay::dispatch::{DispatchLoop, DispatchOutcome};
use crate::relay::types::{Detection, DispatchSnapshot, RequestId, SubmitReceipt};
use crate::relay::worker::{Worker, WorkerEvent};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const COMMAND_BUFFER: usize = 1024;

enum DispatchCommand {
    Submit {
        tokens: Vec<String>,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    Status {
        reply: oneshot::Sender<DispatchSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Timer {
    Restart,
    ResultTimeout(RequestId),
}

/// Cloneable entry point into the dispatcher task.
#[derive(Clone)]
pub struct DispatchHandle {
    commands: mpsc::Sender<DispatchCommand>,
}

impl DispatchHandle {
    /// Queue a frame. Resolves once it is queued, not when it is answered.
    pub async fn submit(&self, tokens: Vec<String>) -> Result<SubmitReceipt> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DispatchCommand::Submit { tokens, reply })
            .await
            .map_err(|_| RelayError::DispatcherClosed)?;
        rx.await.map_err(|_| RelayError::DispatcherClosed)?
    }

    pub async fn status(&self) -> Result<DispatchSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DispatchCommand::Status { reply })
            .await
            .map_err(|_| RelayError::DispatcherClosed)?;
        rx.await.map_err(|_| RelayError::DispatcherClosed)
    }

    /// Kill the worker and stop the dispatcher. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(DispatchCommand::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Dispatcher<W> {
    dispatch: DispatchLoop<W>,
    detections: broadcast::Sender<Detection>,
    result_timeout: Option<Duration>,
    armed_timeout: Option<RequestId>,
    commands: mpsc::Receiver<DispatchCommand>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
}

/// Start the worker and run the dispatcher on its own task.
///
/// Every worker result is published on `detections`.
pub fn spawn_dispatcher<W: Worker>(
    dispatch: DispatchLoop<W>,
    detections: broadcast::Sender<Detection>,
    result_timeout: Option<Duration>,
) -> (DispatchHandle, JoinHandle<()>) {
    let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timers_tx, timers_rx) = mpsc::unbounded_channel();

    let dispatcher = Dispatcher {
        dispatch,
        detections,
        result_timeout,
        armed_timeout: None,
        commands,
        events_tx,
        events_rx,
        timers_tx,
        timers_rx,
    };
    let task = tokio::spawn(dispatcher.run());

    (
        DispatchHandle {
            commands: commands_tx,
        },
        task,
    )
}

impl<W: Worker> Dispatcher<W> {
    async fn run(mut self) {
        if let Err(e) = self.dispatch.start(self.events_tx.clone()) {
            error!("Failed to start worker: {}", e);
            self.schedule_restart();
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DispatchCommand::Submit { tokens, reply }) => {
                        let _ = reply.send(self.dispatch.submit(tokens));
                    }
                    Some(DispatchCommand::Status { reply }) => {
                        let _ = reply.send(self.dispatch.snapshot());
                    }
                    Some(DispatchCommand::Shutdown { done }) => {
                        self.dispatch.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.dispatch.shutdown();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_worker_event(event),
                Some(timer) = self.timers_rx.recv() => self.handle_timer(timer),
            }
            self.arm_result_timeout();
        }

        info!("Dispatcher stopped");
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match self.dispatch.on_worker_event(event) {
            DispatchOutcome::Nothing => {}
            DispatchOutcome::Broadcast(detection) => {
                if let Err(e) = self.detections.send(detection) {
                    debug!(
                        request_id = ?e.0.request_id,
                        "No clients connected; detection not delivered"
                    );
                }
            }
            DispatchOutcome::ScheduleRestart(delay) => self.schedule(Timer::Restart, delay),
        }
    }

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Restart => {
                if let Err(e) = self.dispatch.restart(self.events_tx.clone()) {
                    error!("Failed to restart worker: {}", e);
                    self.schedule_restart();
                }
            }
            Timer::ResultTimeout(request_id) => {
                self.dispatch.on_result_timeout(request_id);
            }
        }
    }

    fn schedule_restart(&mut self) {
        if let Some(delay) = self.dispatch.next_restart() {
            self.schedule(Timer::Restart, delay);
        }
    }

    fn arm_result_timeout(&mut self) {
        let Some(limit) = self.result_timeout else {
            return;
        };
        if let Some(request_id) = self.dispatch.in_flight() {
            if self.armed_timeout != Some(request_id) {
                self.armed_timeout = Some(request_id);
                self.schedule(Timer::ResultTimeout(request_id), limit);
            }
        }
    }

    fn schedule(&self, timer: Timer, delay: Duration) {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        });
    }
}
