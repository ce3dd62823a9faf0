// Dispatch loop: keeps at most one frame in flight to the worker
//
// Every method runs to completion and is driven by exactly one event
// (a submission, a worker event, a timer). The async side lives in
// `service.rs`; this type holds no channels of its own.

use crate::error::{RelayError, Result};
use crate::relay::queue::FrameQueue;
use crate::relay::types::{
    DispatchCounters, DispatchSnapshot, Detection, FramePayload, RequestId, SubmitReceipt,
    WorkerState,
};
use crate::relay::worker::{Worker, WorkerEvent, WorkerEventKind, WorkerEvents};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded restart attempts with doubling backoff. `max_restarts == 0` never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before restart number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff.max(self.initial_backoff))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::never()
    }
}

/// What the async side must do after a worker event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Nothing,
    Broadcast(Detection),
    ScheduleRestart(Duration),
}

pub struct DispatchLoop<W> {
    worker: W,
    queue: FrameQueue,
    in_flight: Option<RequestId>,
    /// Timed-out frames the current process has not answered yet.
    abandoned: u32,
    next_request_id: RequestId,
    restart_policy: RestartPolicy,
    counters: DispatchCounters,
    shutting_down: bool,
}

impl<W: Worker> DispatchLoop<W> {
    pub fn new(worker: W, queue: FrameQueue, restart_policy: RestartPolicy) -> Self {
        Self {
            worker,
            queue,
            in_flight: None,
            abandoned: 0,
            next_request_id: 1,
            restart_policy,
            counters: DispatchCounters::default(),
            shutting_down: false,
        }
    }

    #[cfg(test)]
    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    #[cfg(test)]
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            worker_state: self.worker.state(),
            in_flight: self.in_flight,
            queue_depth: self.queue.len(),
            counters: self.counters,
        }
    }

    /// Initial worker start at system boot.
    pub fn start(&mut self, events: WorkerEvents) -> Result<()> {
        self.worker.start(events)?;
        self.try_dispatch();
        Ok(())
    }

    /// Queue a frame from a client and try to send it straight away.
    pub fn submit(&mut self, tokens: Vec<String>) -> Result<SubmitReceipt> {
        let request_id = self.next_request_id;
        let payload = FramePayload::new(request_id, tokens);

        if let Some(dropped) = self.queue.enqueue(payload)? {
            self.counters.dropped += 1;
            warn!(
                request_id = dropped.request_id,
                queue_depth = self.queue.len(),
                "Frame queue full; dropped frame"
            );
        }
        self.next_request_id += 1;
        self.counters.queued += 1;

        if self.worker.state() != WorkerState::Running {
            debug!(
                request_id,
                worker_state = %self.worker.state(),
                queue_depth = self.queue.len(),
                "Worker unavailable; frame held in queue"
            );
        }
        self.try_dispatch();

        Ok(SubmitReceipt {
            request_id,
            queue_depth: self.queue.len(),
        })
    }

    /// Send the head of the queue if nothing is in flight and the worker is up.
    ///
    /// Returns the id of the frame that was sent.
    pub fn try_dispatch(&mut self) -> Option<RequestId> {
        if self.in_flight.is_some() || self.worker.state() != WorkerState::Running {
            return None;
        }

        let payload = self.queue.dequeue()?;
        match self.worker.submit(&payload) {
            Ok(()) => {
                self.in_flight = Some(payload.request_id);
                self.counters.dispatched += 1;
                debug!(
                    request_id = payload.request_id,
                    queue_depth = self.queue.len(),
                    "Dispatched frame to worker"
                );
                Some(payload.request_id)
            }
            Err(e) => {
                // Nothing reached the pipe, so the frame keeps its place.
                warn!(
                    request_id = payload.request_id,
                    "Could not hand frame to worker: {}", e
                );
                self.queue.requeue_front(payload);
                None
            }
        }
    }

    pub fn on_worker_event(&mut self, event: WorkerEvent) -> DispatchOutcome {
        if event.generation != self.worker.generation() {
            debug!(
                generation = event.generation,
                current = self.worker.generation(),
                "Ignoring event from a previous worker"
            );
            return DispatchOutcome::Nothing;
        }

        match event.kind {
            WorkerEventKind::Output(text) => {
                self.counters.results += 1;
                if self.abandoned > 0 {
                    // The worker answers in order, so this belongs to an abandoned frame.
                    self.abandoned -= 1;
                    self.counters.late_results += 1;
                    debug!(
                        in_flight = ?self.in_flight,
                        "Late result for an abandoned frame"
                    );
                    return DispatchOutcome::Broadcast(Detection {
                        request_id: None,
                        text,
                    });
                }

                let detection = Detection {
                    request_id: self.in_flight.take(),
                    text,
                };
                debug!(request_id = ?detection.request_id, "Worker produced a result");
                self.try_dispatch();
                DispatchOutcome::Broadcast(detection)
            }
            WorkerEventKind::Diagnostic(text) => {
                warn!(generation = event.generation, "Worker stderr: {}", text.trim_end());
                DispatchOutcome::Nothing
            }
            WorkerEventKind::WriteFailed(reason) => {
                self.counters.write_failures += 1;
                error!(
                    request_id = ?self.in_flight,
                    "Failed to write frame to worker: {}", reason
                );
                self.in_flight = None;
                self.try_dispatch();
                DispatchOutcome::Nothing
            }
            WorkerEventKind::Exited { code } => {
                self.worker.mark_exited();
                self.abandoned = 0;
                if let Some(request_id) = self.in_flight.take() {
                    warn!(request_id, "Worker exited with a frame in flight; frame lost");
                }
                if self.shutting_down {
                    return DispatchOutcome::Nothing;
                }
                warn!(?code, queue_depth = self.queue.len(), "Worker exited");
                match self.next_restart() {
                    Some(delay) => DispatchOutcome::ScheduleRestart(delay),
                    None => DispatchOutcome::Nothing,
                }
            }
        }
    }

    /// Consume one restart attempt from the policy, if any remain.
    pub fn next_restart(&mut self) -> Option<Duration> {
        let policy = self.restart_policy;
        if self.counters.restarts >= policy.max_restarts {
            if policy.max_restarts == 0 {
                warn!("No restart policy; queued frames will wait until a worker is started");
            } else {
                error!(
                    restarts = self.counters.restarts,
                    "Worker restart budget exhausted; queued frames will not be dispatched"
                );
            }
            return None;
        }

        let delay = policy.backoff(self.counters.restarts);
        self.counters.restarts += 1;
        info!(
            attempt = self.counters.restarts,
            max = policy.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling worker restart"
        );
        Some(delay)
    }

    /// Start a fresh worker after an exit.
    pub fn restart(&mut self, events: WorkerEvents) -> Result<()> {
        if self.shutting_down {
            return Err(RelayError::DispatcherClosed);
        }
        self.worker.start(events)?;
        info!(
            generation = self.worker.generation(),
            queue_depth = self.queue.len(),
            "Worker restarted"
        );
        self.try_dispatch();
        Ok(())
    }

    /// Give up on `request_id` if it is still the one in flight.
    pub fn on_result_timeout(&mut self, request_id: RequestId) -> bool {
        if self.in_flight != Some(request_id) {
            return false;
        }
        self.counters.result_timeouts += 1;
        self.abandoned += 1;
        warn!(request_id, "No result from worker in time; abandoning frame");
        self.in_flight = None;
        self.try_dispatch();
        true
    }

    /// Kill the worker. Queued frames are not drained.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        info!(
            queue_depth = self.queue.len(),
            in_flight = ?self.in_flight,
            "Shutting down dispatcher"
        );
        if !self.queue.is_empty() {
            warn!(queue_depth = self.queue.len(), "Discarding queued frames");
        }
        self.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::fake::FakeWorker;
    use crate::relay::queue::OverflowPolicy;
    use std::num::NonZeroUsize;
    use tokio::sync::mpsc;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn started(worker: FakeWorker, policy: RestartPolicy) -> DispatchLoop<FakeWorker> {
        let mut dispatch = DispatchLoop::new(worker, FrameQueue::unbounded(), policy);
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatch.start(tx).unwrap();
        dispatch
    }

    fn output(dispatch: &DispatchLoop<FakeWorker>, text: &str) -> WorkerEvent {
        WorkerEvent {
            generation: dispatch.worker().generation(),
            kind: WorkerEventKind::Output(text.to_string()),
        }
    }

    fn exited(dispatch: &DispatchLoop<FakeWorker>) -> WorkerEvent {
        WorkerEvent {
            generation: dispatch.worker().generation(),
            kind: WorkerEventKind::Exited { code: Some(1) },
        }
    }

    #[test]
    fn test_one_frame_in_flight_at_a_time() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, RestartPolicy::never());

        for i in 0..5 {
            dispatch.submit(tokens(&[i.to_string().as_str()])).unwrap();
        }
        assert_eq!(sent.lines(), vec!["0\n"]);
        assert_eq!(dispatch.in_flight(), Some(1));
        assert_eq!(dispatch.queue_depth(), 4);

        for expected in 1..5u64 {
            let event = output(&dispatch, "ok");
            let outcome = dispatch.on_worker_event(event);
            assert!(matches!(outcome, DispatchOutcome::Broadcast(_)));
            assert_eq!(dispatch.in_flight(), Some(expected + 1));
            assert_eq!(sent.lines().len() as u64, expected + 1);
        }

        assert_eq!(sent.lines(), vec!["0\n", "1\n", "2\n", "3\n", "4\n"]);
        dispatch.on_worker_event(output(&dispatch, "ok"));
        assert_eq!(dispatch.in_flight(), None);
        assert_eq!(dispatch.snapshot().counters.results, 5);
    }

    #[test]
    fn test_results_carry_in_flight_request_id() {
        let worker = FakeWorker::new();
        let mut dispatch = started(worker, RestartPolicy::never());

        dispatch.submit(tokens(&["a", "b"])).unwrap();
        dispatch.submit(tokens(&["c"])).unwrap();

        let first = dispatch.on_worker_event(output(&dispatch, "a,b"));
        let second = dispatch.on_worker_event(output(&dispatch, "c"));
        assert_eq!(
            first,
            DispatchOutcome::Broadcast(Detection {
                request_id: Some(1),
                text: "a,b".to_string()
            })
        );
        assert_eq!(
            second,
            DispatchOutcome::Broadcast(Detection {
                request_id: Some(2),
                text: "c".to_string()
            })
        );
    }

    #[test]
    fn test_unsolicited_output_is_still_broadcast() {
        let worker = FakeWorker::new();
        let mut dispatch = started(worker, RestartPolicy::never());

        let outcome = dispatch.on_worker_event(output(&dispatch, "banner"));
        assert_eq!(
            outcome,
            DispatchOutcome::Broadcast(Detection {
                request_id: None,
                text: "banner".to_string()
            })
        );
    }

    #[test]
    fn test_frames_accumulate_while_worker_unstarted() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch =
            DispatchLoop::new(worker, FrameQueue::unbounded(), RestartPolicy::never());

        for i in 0..4 {
            let receipt = dispatch.submit(tokens(&["x"])).unwrap();
            assert_eq!(receipt.queue_depth, i + 1);
        }
        assert!(sent.lines().is_empty());
        assert_eq!(dispatch.in_flight(), None);

        // Starting the worker releases the head of the queue.
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatch.start(tx).unwrap();
        assert_eq!(sent.lines().len(), 1);
        assert_eq!(dispatch.queue_depth(), 3);
    }

    #[test]
    fn test_exit_without_restart_policy_stalls() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, RestartPolicy::never());

        dispatch.submit(tokens(&["a"])).unwrap();
        let outcome = dispatch.on_worker_event(exited(&dispatch));
        assert_eq!(outcome, DispatchOutcome::Nothing);
        assert_eq!(dispatch.worker().state(), WorkerState::Exited);
        assert_eq!(dispatch.in_flight(), None);

        for expected_depth in 1..=3 {
            let receipt = dispatch.submit(tokens(&["b"])).unwrap();
            assert_eq!(receipt.queue_depth, expected_depth);
        }
        assert_eq!(sent.lines(), vec!["a\n"]);
    }

    #[test]
    fn test_exit_schedules_bounded_restarts() {
        let policy = RestartPolicy {
            max_restarts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(150),
        };
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, policy);
        dispatch.submit(tokens(&["a"])).unwrap();
        dispatch.submit(tokens(&["b"])).unwrap();

        let outcome = dispatch.on_worker_event(exited(&dispatch));
        assert_eq!(
            outcome,
            DispatchOutcome::ScheduleRestart(Duration::from_millis(100))
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        dispatch.restart(tx).unwrap();
        assert_eq!(dispatch.worker().generation(), 2);
        assert_eq!(sent.lines(), vec!["a\n", "b\n"]);

        let outcome = dispatch.on_worker_event(exited(&dispatch));
        assert_eq!(
            outcome,
            DispatchOutcome::ScheduleRestart(Duration::from_millis(150))
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        dispatch.restart(tx).unwrap();
        let outcome = dispatch.on_worker_event(exited(&dispatch));
        assert_eq!(outcome, DispatchOutcome::Nothing);
        assert_eq!(dispatch.snapshot().counters.restarts, 2);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let worker = FakeWorker::new();
        let mut dispatch = started(worker, RestartPolicy::never());
        dispatch.submit(tokens(&["a"])).unwrap();

        let stale = WorkerEvent {
            generation: 0,
            kind: WorkerEventKind::Exited { code: None },
        };
        assert_eq!(dispatch.on_worker_event(stale), DispatchOutcome::Nothing);
        assert_eq!(dispatch.worker().state(), WorkerState::Running);
        assert_eq!(dispatch.in_flight(), Some(1));
    }

    #[test]
    fn test_write_failure_clears_in_flight() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, RestartPolicy::never());
        dispatch.submit(tokens(&["a"])).unwrap();
        dispatch.submit(tokens(&["b"])).unwrap();

        let event = WorkerEvent {
            generation: dispatch.worker().generation(),
            kind: WorkerEventKind::WriteFailed("broken pipe".to_string()),
        };
        dispatch.on_worker_event(event);

        assert_eq!(dispatch.in_flight(), Some(2));
        assert_eq!(sent.lines(), vec!["a\n", "b\n"]);
        assert_eq!(dispatch.snapshot().counters.write_failures, 1);
    }

    #[test]
    fn test_rejected_handoff_keeps_frame_queued() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        worker.fail_next_submit(RelayError::InputBusy);
        let mut dispatch = started(worker, RestartPolicy::never());

        let receipt = dispatch.submit(tokens(&["a"])).unwrap();
        assert_eq!(receipt.queue_depth, 1);
        assert_eq!(dispatch.in_flight(), None);

        assert_eq!(dispatch.try_dispatch(), Some(1));
        assert_eq!(sent.lines(), vec!["a\n"]);
    }

    #[test]
    fn test_result_timeout_advances_queue() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, RestartPolicy::never());
        dispatch.submit(tokens(&["a"])).unwrap();
        dispatch.submit(tokens(&["b"])).unwrap();

        assert!(!dispatch.on_result_timeout(2));
        assert!(dispatch.on_result_timeout(1));
        assert_eq!(dispatch.in_flight(), Some(2));
        assert_eq!(sent.lines(), vec!["a\n", "b\n"]);
        assert_eq!(dispatch.snapshot().counters.result_timeouts, 1);
    }

    #[test]
    fn test_late_result_after_timeout_is_not_misattributed() {
        let worker = FakeWorker::new();
        let sent = worker.sent();
        let mut dispatch = started(worker, RestartPolicy::never());
        for token in ["a", "b", "c"] {
            dispatch.submit(tokens(&[token])).unwrap();
        }

        assert!(dispatch.on_result_timeout(1));
        let outcome = dispatch.on_worker_event(output(&dispatch, "a"));
        assert_eq!(
            outcome,
            DispatchOutcome::Broadcast(Detection {
                request_id: None,
                text: "a".to_string()
            })
        );
        // Frame 2 is still owed, so frame 3 must wait.
        assert_eq!(dispatch.in_flight(), Some(2));
        assert_eq!(sent.lines(), vec!["a\n", "b\n"]);

        let outcome = dispatch.on_worker_event(output(&dispatch, "b"));
        assert_eq!(
            outcome,
            DispatchOutcome::Broadcast(Detection {
                request_id: Some(2),
                text: "b".to_string()
            })
        );
        assert_eq!(dispatch.in_flight(), Some(3));
        assert_eq!(sent.lines(), vec!["a\n", "b\n", "c\n"]);
        assert_eq!(dispatch.snapshot().counters.late_results, 1);
    }

    #[test]
    fn test_restarted_worker_owes_no_late_results() {
        let policy = RestartPolicy {
            max_restarts: 1,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };
        let worker = FakeWorker::new();
        let mut dispatch = started(worker, policy);
        dispatch.submit(tokens(&["a"])).unwrap();
        dispatch.submit(tokens(&["b"])).unwrap();

        assert!(dispatch.on_result_timeout(1));
        dispatch.on_worker_event(exited(&dispatch));
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatch.restart(tx).unwrap();
        assert_eq!(dispatch.in_flight(), None);

        dispatch.submit(tokens(&["c"])).unwrap();
        let outcome = dispatch.on_worker_event(output(&dispatch, "c"));
        assert_eq!(
            outcome,
            DispatchOutcome::Broadcast(Detection {
                request_id: Some(3),
                text: "c".to_string()
            })
        );
    }

    #[test]
    fn test_overflow_counts_dropped_frames() {
        let worker = FakeWorker::new();
        let queue = FrameQueue::new(NonZeroUsize::new(1), OverflowPolicy::DropOldest);
        let mut dispatch = DispatchLoop::new(worker, queue, RestartPolicy::never());

        dispatch.submit(tokens(&["a"])).unwrap();
        dispatch.submit(tokens(&["b"])).unwrap();
        let snapshot = dispatch.snapshot();
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.counters.dropped, 1);
        assert_eq!(snapshot.counters.queued, 2);
    }

    #[test]
    fn test_reject_overflow_surfaces_error() {
        let worker = FakeWorker::new();
        let queue = FrameQueue::new(NonZeroUsize::new(1), OverflowPolicy::Reject);
        let mut dispatch = DispatchLoop::new(worker, queue, RestartPolicy::never());

        dispatch.submit(tokens(&["a"])).unwrap();
        let err = dispatch.submit(tokens(&["b"])).unwrap_err();
        assert!(matches!(err, RelayError::QueueFull(1)));
        assert_eq!(dispatch.snapshot().counters.queued, 1);
    }

    #[test]
    fn test_shutdown_stops_worker_without_restart() {
        let policy = RestartPolicy {
            max_restarts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };
        let worker = FakeWorker::new();
        let mut dispatch = started(worker, policy);
        dispatch.shutdown();
        assert!(dispatch.worker().stopped());

        let event = exited(&dispatch);
        assert_eq!(dispatch.on_worker_event(event), DispatchOutcome::Nothing);
        assert_eq!(dispatch.snapshot().counters.restarts, 0);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RestartPolicy {
            max_restarts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }
}
