//! Worker-thread session service
//!
//! # Architecture
//!
//! Engine handles wrap raw pointers and are not `Send`, so the engine is
//! built on a dedicated worker thread which owns the [`Session`] for its whole
//! life. Callers send commands over a channel and block on a reply channel;
//! requests from several threads are therefore served strictly one at a time.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::config::DriverConfig;
use crate::engine::InferenceEngine;
use crate::session::Session;

/// Errors that can occur while starting the service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Message returned by `generate` once the worker is gone
pub const WORKER_UNAVAILABLE: &str = "Error: Worker thread unavailable";

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        path: PathBuf,
        response_tx: Sender<bool>,
    },
    Generate {
        prompt: String,
        response_tx: Sender<String>,
    },
    Unload {
        response_tx: Sender<()>,
    },
    Shutdown,
}

/// Blocking load / generate / unload backed by a worker thread.
pub struct SessionService {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl SessionService {
    /// Starts the worker. `make_engine` runs on the worker thread.
    pub fn spawn<E, F>(make_engine: F, config: DriverConfig) -> Result<Self, ServiceError>
    where
        E: InferenceEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("pocketllm-worker".into())
            .spawn(move || {
                let session = Session::new(make_engine(), config);
                worker_thread_main(session, command_rx);
            })?;

        tracing::info!("Session worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
        })
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> WorkerCommand) -> Option<T> {
        let command_tx = self.command_tx.as_ref()?;
        let (response_tx, response_rx) = mpsc::channel();
        command_tx.send(build(response_tx)).ok()?;
        response_rx.recv().ok()
    }

    /// Loads a model; `false` if it could not be loaded.
    pub fn load(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        self.request(|response_tx| WorkerCommand::Load { path, response_tx })
            .unwrap_or(false)
    }

    /// Generates a reply. Failures come back as `"Error: ..."` text.
    pub fn generate(&self, prompt: &str) -> String {
        let prompt = prompt.to_string();
        self.request(|response_tx| WorkerCommand::Generate {
            prompt,
            response_tx,
        })
        .unwrap_or_else(|| WORKER_UNAVAILABLE.to_string())
    }

    /// Unloads the model and backend. Safe to call repeatedly.
    pub fn unload(&self) {
        if self
            .request(|response_tx| WorkerCommand::Unload { response_tx })
            .is_none()
        {
            tracing::debug!("Unload skipped, worker not running");
        }
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the session and processes commands until shutdown. The session is
/// unloaded when this returns.
fn worker_thread_main<E: InferenceEngine>(
    mut session: Session<E>,
    command_rx: Receiver<WorkerCommand>,
) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { path, response_tx }) => {
                let _ = response_tx.send(session.load_model(&path));
            }
            Ok(WorkerCommand::Generate {
                prompt,
                response_tx,
            }) => {
                let _ = response_tx.send(session.generate_text(&prompt));
            }
            Ok(WorkerCommand::Unload { response_tx }) => {
                session.unload();
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}
