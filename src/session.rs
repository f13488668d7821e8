//! Session controller
//!
//! Owns the real-time connection lifecycle. Controller commands and effect
//! completions are funnelled into a single state loop, which is the only
//! writer of session state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::DeviceArbiter;
use crate::credentials::CredentialProvider;
use crate::effects::{EffectRunner, RoomEffectRunner};
use crate::error::SessionError;
use crate::room::RealtimeRoom;
use crate::settings::ExamSettings;
use crate::state_machine::{reduce, validate, Effect, Event, State};

const SIGNAL_CAPACITY: usize = 32;
/// Upper bound on how long shutdown waits for the room to close
const SHUTDOWN_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session state exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Errored => "errored",
        }
    }
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    StateChanged(SessionState),
    /// The connection was lost; show "session ended"
    SessionEnded,
    /// The "session ended" display window is over; navigate away
    SessionEndedWindowElapsed,
    /// Non-fatal media device problem
    DeviceWarning { message: String },
    /// `start()` was accepted but did not reach Connected
    StartFailed { error: SessionError },
}

/// Read-only view of a session, handed to the turn pipeline.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    generation: Arc<AtomicU64>,
    devices: DeviceArbiter,
}

impl SessionHandle {
    /// A handle with no controller behind it. The generation never changes,
    /// so nothing held through it is ever invalidated.
    pub fn standalone(devices: DeviceArbiter) -> Self {
        let (_tx, state) = watch::channel(SessionState::Idle);
        Self {
            state,
            generation: Arc::new(AtomicU64::new(0)),
            devices,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Current generation token. Changes whenever a session attempt is
    /// started or superseded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> &DeviceArbiter {
        &self.devices
    }

    /// Wait until the session state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, SessionError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        Ok(*reached)
    }
}

struct Command {
    event: Event,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

/// Controller for one candidate's real-time session.
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    signals: broadcast::Sender<SessionSignal>,
    handle: SessionHandle,
    state_loop: JoinHandle<()>,
}

impl SessionController {
    /// Spawn the state loop on the current runtime.
    pub fn spawn(
        room: Arc<dyn RealtimeRoom>,
        credentials: Arc<dyn CredentialProvider>,
        devices: DeviceArbiter,
        settings: &ExamSettings,
    ) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let effect_runner = RoomEffectRunner::new(
            room,
            credentials,
            generation.clone(),
            settings.pre_connect_buffer_enabled,
            settings.session_ended_display(),
        );

        let (commands_tx, commands_rx) = mpsc::channel::<Command>(8);
        let (tx, rx) = mpsc::channel::<Event>(32);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        let state_loop = tokio::spawn(run_state_loop(
            commands_rx,
            rx,
            tx,
            effect_runner,
            generation.clone(),
            state_tx,
            signals.clone(),
        ));

        Self {
            commands: commands_tx,
            signals,
            handle: SessionHandle {
                state: state_rx,
                generation,
                devices,
            },
            state_loop,
        }
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.command(Event::Start).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.command(Event::Stop).await
    }

    /// Leave Errored for Idle.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.command(Event::Reset).await
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Tear down any live connection and stop the state loop. Returns once
    /// the room has been released.
    pub async fn shutdown(self) {
        if self.command(Event::Exit).await.is_err() {
            log::debug!("Session loop already stopped");
        }
        if let Err(e) = self.state_loop.await {
            log::error!("Session loop task failed: {}", e);
        }
    }

    async fn command(&self, event: Event) -> Result<(), SessionError> {
        let (reply, verdict) = oneshot::channel();
        self.commands
            .send(Command { event, reply })
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        verdict.await.map_err(|_| SessionError::ControllerClosed)?
    }
}

fn publish(
    state: &State,
    published: &watch::Sender<SessionState>,
    signals: &broadcast::Sender<SessionSignal>,
) {
    let next = state.public();
    let changed = published.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
    if changed {
        log::debug!("Publishing session state: {}", next.as_str());
        let _ = signals.send(SessionSignal::StateChanged(next));
    }
}

/// Run the session state loop
async fn run_state_loop(
    mut commands: mpsc::Receiver<Command>,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    generation: Arc<AtomicU64>,
    published: watch::Sender<SessionState>,
    signals: broadcast::Sender<SessionSignal>,
) {
    let mut state = State::default();
    // Teardowns spawned but not yet reported done
    let mut teardowns_in_flight: usize = 0;
    log::info!("Session loop started");

    loop {
        let event = tokio::select! {
            command = commands.recv() => match command {
                Some(Command { event, reply }) => {
                    let verdict = validate(&state, &event);
                    let accepted = verdict.is_ok();
                    if let Err(e) = &verdict {
                        log::warn!("Rejected command: {}", e);
                    }
                    let _ = reply.send(verdict);
                    if !accepted {
                        continue;
                    }
                    event
                }
                // Every controller handle is gone
                None => Event::Exit,
            },
            Some(event) = rx.recv() => event,
        };

        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            if !matches!(state, State::Idle { .. }) {
                let next = state.generation() + 1;
                generation.store(next, Ordering::SeqCst);
                effect_runner.spawn(Effect::Teardown { generation: next }, tx.clone());
                teardowns_in_flight += 1;
            }
            log::info!("Exit requested, shutting down session loop");
            drain_teardowns(&mut rx, teardowns_in_flight).await;
            break;
        }

        if let Event::TeardownDone { .. } = event {
            teardowns_in_flight = teardowns_in_flight.saturating_sub(1);
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;
        // Publish before spawning so runners see the new generation
        generation.store(state.generation(), Ordering::SeqCst);

        for eff in effects {
            match eff {
                Effect::EmitUi => publish(&state, &published, &signals),
                Effect::Notify(signal) => {
                    let _ = signals.send(signal);
                }
                other => {
                    if let Effect::Teardown { .. } = other {
                        teardowns_in_flight += 1;
                    }
                    effect_runner.spawn(other, tx.clone())
                }
            }
        }
    }

    log::info!("Session loop ended");
}

/// Wait for outstanding teardowns so the room is closed before the loop
/// exits. Other events are dropped.
async fn drain_teardowns(rx: &mut mpsc::Receiver<Event>, mut in_flight: usize) {
    let deadline = tokio::time::sleep(SHUTDOWN_TEARDOWN_TIMEOUT);
    tokio::pin!(deadline);

    while in_flight > 0 {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::TeardownDone { generation }) => {
                    log::debug!("Shutdown: teardown for generation {} finished", generation);
                    in_flight -= 1;
                }
                Some(_) => {}
                None => break,
            },
            _ = &mut deadline => {
                log::warn!("Shutdown: giving up on {} unfinished teardown(s)", in_flight);
                break;
            }
        }
    }
}
