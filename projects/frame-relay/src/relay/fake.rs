// Scripted worker for tests: records submitted lines and injects events

use crate::error::{RelayError, Result};
use crate::relay::types::{FramePayload, WorkerState};
use crate::relay::worker::{Worker, WorkerEvent, WorkerEventKind, WorkerEvents};
use std::sync::{Arc, Mutex};

/// Lines the fake worker accepted, shared with the test.
#[derive(Clone, Default)]
pub struct SentLines(Arc<Mutex<Vec<String>>>);

impl SentLines {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Lets a test push events as if they came from the running process.
#[derive(Clone, Default)]
pub struct EventTap(Arc<Mutex<Option<(u64, WorkerEvents)>>>);

impl EventTap {
    pub fn emit(&self, kind: WorkerEventKind) {
        if let Some((generation, events)) = self.0.lock().unwrap().as_ref() {
            let _ = events.send(WorkerEvent {
                generation: *generation,
                kind,
            });
        }
    }

    pub fn output(&self, text: &str) {
        self.emit(WorkerEventKind::Output(text.to_string()));
    }

    pub fn exit(&self, code: i32) {
        self.emit(WorkerEventKind::Exited { code: Some(code) });
    }
}

#[derive(Default)]
pub struct FakeWorker {
    state: Option<WorkerState>,
    generation: u64,
    echo: bool,
    stopped: bool,
    sent: SentLines,
    tap: EventTap,
    next_failure: Arc<Mutex<Option<RelayError>>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every line with the line itself, minus the newline.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> SentLines {
        self.sent.clone()
    }

    pub fn tap(&self) -> EventTap {
        self.tap.clone()
    }

    pub fn fail_next_submit(&self, error: RelayError) {
        *self.next_failure.lock().unwrap() = Some(error);
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }
}

impl Worker for FakeWorker {
    fn state(&self) -> WorkerState {
        self.state.unwrap_or(WorkerState::Unstarted)
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn start(&mut self, events: WorkerEvents) -> Result<()> {
        self.generation += 1;
        self.state = Some(WorkerState::Running);
        *self.tap.0.lock().unwrap() = Some((self.generation, events));
        Ok(())
    }

    fn submit(&mut self, payload: &FramePayload) -> Result<()> {
        if self.state() != WorkerState::Running {
            return Err(RelayError::WorkerUnavailable(self.state()));
        }
        if let Some(error) = self.next_failure.lock().unwrap().take() {
            return Err(error);
        }

        let line = payload.to_wire_line();
        self.sent.0.lock().unwrap().push(line.clone());
        if self.echo {
            self.tap.output(line.trim_end_matches('\n'));
        }
        Ok(())
    }

    fn mark_exited(&mut self) {
        self.state = Some(WorkerState::Exited);
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.state = Some(WorkerState::Exited);
    }
}
