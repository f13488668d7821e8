//! Turn pipeline
//!
//! Runs the record -> encode -> submit -> reply -> play cycle for one
//! conversation turn at a time. A turn is either recording or processing;
//! `begin_turn` is rejected in both, so at most one recording exists and at
//! most one submission is in flight.
//!
//! The submission runs on its own task and the state lock is never held
//! across its await. Results that arrive after `end_session()` or after the
//! session generation has moved on are discarded without touching the history.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::audio::{AudioInput, RecordingHandle, TurnPlayer, TurnRecorder};
use crate::conversation::{ConversationLog, ConversationProgress, ConversationTurn};
use crate::error::{PlaybackError, TurnError};
use crate::session::SessionHandle;
use crate::settings::ExamSettings;
use crate::transport::{HistoryEntry, TurnRequest, TurnTransport};

/// Externally visible pipeline sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnPhase {
    Idle,
    Recording,
    Processing,
}

/// What `end_turn` did with the recording.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Transcript and reply appended
    Replied {
        step_count: u32,
        completed: bool,
        /// Reply playback, if the pipeline sent audio
        playback: Option<JoinHandle<Result<(), PlaybackError>>>,
    },
    /// The submission failed; an apology was appended and the turn can be retried
    Apologised { reason: String },
    /// The session ended while the turn was in flight
    Discarded,
}

enum Phase {
    Idle,
    Recording(RecordingHandle),
    Processing,
}

struct Inner {
    phase: Phase,
    log: ConversationLog,
    closed: bool,
}

/// State the submission task needs after `end_turn` hands it off.
struct Shared {
    transport: Arc<dyn TurnTransport>,
    player: TurnPlayer,
    session: SessionHandle,
    apology_message: String,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Finish the recording, submit it and apply the result.
    ///
    /// Runs on its own task so the phase returns to idle even when the
    /// caller stops waiting for the outcome.
    async fn process(
        &self,
        handle: RecordingHandle,
        history: Vec<HistoryEntry>,
        step: u32,
        generation: u64,
    ) -> TurnOutcome {
        let result = match tokio::task::spawn_blocking(move || handle.finish()).await {
            Ok(Ok(blob)) => {
                log::info!("Turn recording finalized: {} ms", blob.duration_ms);
                let request = TurnRequest {
                    audio: blob.bytes,
                    history,
                    conversation_step: step,
                };
                self.transport
                    .submit(request)
                    .await
                    .map_err(|e| e.to_string())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("recording task failed: {}", e)),
        };

        let mut inner = self.lock();
        inner.phase = Phase::Idle;

        if inner.closed || self.session.generation() != generation {
            log::info!("Discarding turn result: session ended while it was in flight");
            return TurnOutcome::Discarded;
        }

        match result {
            Ok(reply) => {
                inner
                    .log
                    .record_exchange(&reply.transcribed_text, &reply.ai_response);
                let step_count = inner.log.advance_step(reply.conversation_step);
                let completed = inner.log.progress().completed;
                drop(inner);

                let playback = reply.audio_response.map(|audio| self.player.play(audio));
                TurnOutcome::Replied {
                    step_count,
                    completed,
                    playback,
                }
            }
            Err(reason) => self.apologise(&mut inner, reason),
        }
    }

    fn apologise(&self, inner: &mut Inner, reason: String) -> TurnOutcome {
        log::warn!("Turn failed, asking the candidate to retry: {}", reason);
        inner.log.record_apology(&self.apology_message);
        TurnOutcome::Apologised { reason }
    }
}

pub struct TurnPipeline {
    recorder: TurnRecorder,
    shared: Arc<Shared>,
}

impl TurnPipeline {
    /// The recorder shares the session's device arbiter, so a turn cannot
    /// record while pre-connect buffering holds the microphone.
    pub fn new(
        input: Arc<dyn AudioInput>,
        transport: Arc<dyn TurnTransport>,
        player: TurnPlayer,
        session: SessionHandle,
        settings: &ExamSettings,
    ) -> Self {
        let recorder = TurnRecorder::new(input, session.devices().clone());
        let log = ConversationLog::with_greeting(settings.turn_limit, settings.greeting.as_deref());
        Self {
            recorder,
            shared: Arc::new(Shared {
                transport,
                player,
                session,
                apology_message: settings.apology_message.clone(),
                inner: Mutex::new(Inner {
                    phase: Phase::Idle,
                    log,
                    closed: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock()
    }

    /// Start recording the candidate's answer.
    pub fn begin_turn(&self) -> Result<(), TurnError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TurnError::SessionClosed);
        }
        if inner.log.progress().completed {
            return Err(TurnError::Completed);
        }
        match inner.phase {
            Phase::Recording(_) => return Err(TurnError::RecordingActive),
            Phase::Processing => return Err(TurnError::Processing),
            Phase::Idle => {}
        }

        let handle = self.recorder.start().map_err(|e| {
            log::error!("Failed to start turn recording: {}", e);
            TurnError::from(e)
        })?;
        log::info!(
            "Turn recording {} started at step {}",
            handle.id(),
            inner.log.progress().step_count
        );
        inner.phase = Phase::Recording(handle);
        Ok(())
    }

    /// Stop recording, submit the turn and apply the result.
    ///
    /// Dropping the returned future does not cancel the submission: the
    /// result is still applied and the pipeline returns to idle.
    pub async fn end_turn(&self) -> Result<TurnOutcome, TurnError> {
        let generation = self.shared.session.generation();

        let (handle, history, step) = {
            let mut inner = self.lock();
            let handle = match std::mem::replace(&mut inner.phase, Phase::Processing) {
                Phase::Recording(handle) => handle,
                other => {
                    inner.phase = other;
                    return Err(TurnError::NotRecording);
                }
            };
            (
                handle,
                inner.log.wire_history(),
                inner.log.progress().step_count,
            )
        };

        let shared = self.shared.clone();
        let task =
            tokio::spawn(async move { shared.process(handle, history, step, generation).await });

        match task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("Turn submission task failed: {}", e);
                let mut inner = self.lock();
                inner.phase = Phase::Idle;
                if inner.closed || self.shared.session.generation() != generation {
                    return Ok(TurnOutcome::Discarded);
                }
                Ok(self.shared.apologise(&mut inner, e.to_string()))
            }
        }
    }

    /// Close the pipeline. Any active recording is dropped and any in-flight
    /// result will be discarded.
    pub fn end_session(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if let Phase::Recording(handle) = std::mem::replace(&mut inner.phase, Phase::Idle) {
            log::info!("Discarding turn recording {} at session end", handle.id());
            drop(handle);
        }
    }

    pub fn phase(&self) -> TurnPhase {
        match self.lock().phase {
            Phase::Idle => TurnPhase::Idle,
            Phase::Recording(_) => TurnPhase::Recording,
            Phase::Processing => TurnPhase::Processing,
        }
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.lock().log.turns().to_vec()
    }

    pub fn progress(&self) -> ConversationProgress {
        self.lock().log.progress()
    }
}
