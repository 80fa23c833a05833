//! Dedicated audio I/O thread: isolates `!Send` audio resources from the async runtime.
//!
//! `cpal::Stream` (capture) and `rodio::OutputStream` (playback) are `!Send`
//! on some platforms. Each device adapter confines its stream to one OS thread
//! created here and talks to it through an `std::sync::mpsc` channel.
//!
//! [`AudioThread`] is the `Send + Sync` proxy the adapters hold. Work is sent
//! as closures over the thread-owned state, so every adapter gets the same
//! request/reply plumbing without a per-adapter command enum.

use std::sync::{Mutex, PoisonError, mpsc};
use std::thread;

use crate::error::VoiceError;

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// A command sent to the audio thread.
enum AudioCommand<S> {
    /// Run a closure against the thread-owned state.
    Run(Job<S>),

    /// Drop the state and exit.
    Shutdown,
}

/// `Send + Sync` handle to a thread that owns a value of type `S`.
///
/// Request/reply calls block the caller until the audio thread responds;
/// the latency is a local channel round trip plus the audio operation.
pub struct AudioThread<S: 'static> {
    name: String,
    cmd_tx: mpsc::Sender<AudioCommand<S>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S: 'static> AudioThread<S> {
    /// Spawn the thread and build its state there.
    ///
    /// `init` runs on the new thread. It returns the state to keep plus a
    /// `Send` value handed back to the caller (for example a stream handle
    /// that may cross threads). Errors from `init` are propagated through a
    /// one-shot init channel.
    pub fn spawn<R, F>(name: &str, init: F) -> Result<(Self, R), VoiceError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<(S, R), VoiceError> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<AudioCommand<S>>();
        let (init_tx, init_rx) = mpsc::channel::<Result<R, VoiceError>>();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&thread_name, init, &cmd_rx, &init_tx))
            .map_err(|e| {
                VoiceError::OutputStreamError(format!("failed to spawn audio thread: {e}"))
            })?;

        // Wait for the audio thread to finish initialisation.
        let ready = match init_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(VoiceError::AudioThreadDied),
        };
        let ready = match ready {
            Ok(value) => value,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };

        Ok((
            Self {
                name: name.to_string(),
                cmd_tx,
                thread: Mutex::new(Some(thread)),
            },
            ready,
        ))
    }

    /// Run `f` on the audio thread and wait for its result.
    pub fn call<R, F>(&self, f: F) -> Result<R, VoiceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job<S> = Box::new(move |state| {
            let _ = tx.send(f(state));
        });
        self.cmd_tx
            .send(AudioCommand::Run(job))
            .map_err(|_| VoiceError::AudioThreadDied)?;
        rx.recv().map_err(|_| VoiceError::AudioThreadDied)
    }

    /// Whether the thread is still accepting work.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the thread, dropping its state. Idempotent.
    pub fn shutdown(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.cmd_tx.send(AudioCommand::Shutdown);
        if handle.join().is_err() {
            tracing::warn!(thread = %self.name, "Audio thread panicked during shutdown");
        }
    }

    // ── Audio thread event loop ────────────────────────────────────

    fn run<R, F>(
        name: &str,
        init: F,
        cmd_rx: &mpsc::Receiver<AudioCommand<S>>,
        init_tx: &mpsc::Sender<Result<R, VoiceError>>,
    ) where
        F: FnOnce() -> Result<(S, R), VoiceError>,
    {
        let mut state = match init() {
            Ok((state, ready)) => {
                let _ = init_tx.send(Ok(ready));
                state
            }
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };

        tracing::debug!(thread = name, "Audio thread started");

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                AudioCommand::Run(job) => job(&mut state),
                AudioCommand::Shutdown => break,
            }
        }

        drop(state);
        tracing::debug!(thread = name, "Audio thread shut down");
    }
}

impl<S: 'static> Drop for AudioThread<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
