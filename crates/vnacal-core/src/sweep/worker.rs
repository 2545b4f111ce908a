//! Background sweep thread

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use super::orchestrator::{CancelToken, SweepEvent, SweepMode, SweepOrchestrator};
use super::transport::SegmentSource;

/// Capacity of the worker's event channel
pub const EVENT_CAPACITY: usize = 64;

/// Runs a `SweepOrchestrator` on its own thread.
///
/// Every finished pass is published as `SweepEvent::Completed`. The event
/// channel disconnects once the thread exits: after one pass in single and
/// average mode, after cancellation in continuous mode.
///
/// The channel holds at most [`EVENT_CAPACITY`] events. Progress events are
/// dropped while it is full; `Completed` waits for room, so an undrained
/// continuous worker stalls instead of queueing passes.
pub struct SweepWorker {
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
    events: Receiver<SweepEvent>,
}

impl SweepWorker {
    pub fn spawn<S>(orchestrator: SweepOrchestrator<S>) -> std::io::Result<Self>
    where
        S: SegmentSource + Send + 'static,
    {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        let cancel = orchestrator.cancel_token();
        let mut orchestrator = orchestrator.with_events(tx.clone());

        let handle = thread::Builder::new()
            .name("sweep".to_string())
            .spawn(move || {
                info!(mode = ?orchestrator.mode(), "Sweep worker started");
                loop {
                    let outcome = orchestrator.run_once();
                    let stop = outcome.cancelled || orchestrator.mode() != SweepMode::Continuous;
                    if tx.send(SweepEvent::Completed(outcome)).is_err() {
                        debug!("Sweep event receiver dropped, stopping");
                        break;
                    }
                    if stop {
                        break;
                    }
                }
                info!("Sweep worker stopped");
            })?;

        Ok(Self {
            handle: Some(handle),
            cancel,
            events: rx,
        })
    }

    pub fn events(&self) -> &Receiver<SweepEvent> {
        &self.events
    }

    /// Request a cooperative stop at the next segment boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the thread to exit. Returns `false` if it panicked.
    pub fn join(mut self) -> bool {
        self.join_inner()
    }

    fn join_inner(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        // Events are unreachable past this point; drain so a pending
        // `Completed` cannot block the thread
        while !handle.is_finished() {
            match self.events.recv_timeout(Duration::from_millis(10)) {
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        handle.join().is_ok()
    }
}

impl Drop for SweepWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
            self.join_inner();
        }
    }
}
