//! The reactor pump: a dedicated thread draining the engine's event stream.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::EngineEvent;
use crate::error::{AmqpError, Result};
use crate::sync::Gate;

/// Whether the pump keeps draining events after a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpFlow {
    Continue,
    Stop,
}

/// Runs the engine's event loop on its own named OS thread until the handler
/// signals stop (the engine's final event) or the event stream closes.
pub struct ReactorPump {
    handle: Option<JoinHandle<()>>,
    finished: Arc<Gate>,
}

impl ReactorPump {
    /// Spawns the pump thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread cannot be spawned.
    pub fn spawn<F>(name: &str, events: Receiver<EngineEvent>, mut handler: F) -> Result<Self>
    where
        F: FnMut(EngineEvent) -> PumpFlow + Send + 'static,
    {
        let finished = Arc::new(Gate::new());
        let finished_in_thread = Arc::clone(&finished);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    if handler(event) == PumpFlow::Stop {
                        break;
                    }
                }
                debug!("reactor pump wound down");
                finished_in_thread.open();
            })
            .map_err(|e| AmqpError::Io(format!("could not spawn the reactor thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
            finished,
        })
    }

    /// Waits up to `grace` for the pump thread to finish, then joins it. A
    /// thread that outlives the grace period is abandoned with a warning; it
    /// exits on its own once the engine's event stream closes.
    pub fn join_with_grace(mut self, grace: Duration) {
        if self.finished.wait_timeout(grace) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        } else {
            warn!("reactor thread did not stop within the grace period; detaching");
            self.handle.take();
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_open()
    }
}
