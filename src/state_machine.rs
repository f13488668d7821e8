//! State machine for the real-time session lifecycle
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! Every start attempt and every teardown runs under a generation token. The
//! token is bumped whenever an in-flight attempt is superseded (stop, failure,
//! connection loss), so completions carrying an older token are dropped here
//! and undone by the effect runner.

use crate::error::SessionError;
use crate::session::{SessionSignal, SessionState};

/// Why a start attempt is being unwound.
#[derive(Debug, Clone)]
pub enum StartFailure {
    /// Credentials could not be obtained; the session returns to Idle.
    Credentials(SessionError),
    /// Microphone or connection failure; the session lands in Errored.
    Fatal(SessionError),
}

impl StartFailure {
    fn classify(error: SessionError) -> Self {
        match error {
            SessionError::CredentialUnavailable(_) => StartFailure::Credentials(error),
            other => StartFailure::Fatal(other),
        }
    }

    fn error(&self) -> &SessionError {
        match self {
            StartFailure::Credentials(e) | StartFailure::Fatal(e) => e,
        }
    }
}

/// Internal state of the session lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle {
        generation: u64,
    },
    Connecting {
        generation: u64,
        microphone_ready: bool,
        connected: bool,
    },
    Connected {
        generation: u64,
    },
    /// A start attempt failed; tearing down whatever it opened before
    /// reporting the failure.
    Aborting {
        generation: u64,
        failure: StartFailure,
    },
    Disconnecting {
        generation: u64,
    },
    Errored {
        generation: u64,
        error: SessionError,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle { generation: 0 }
    }
}

impl State {
    pub fn generation(&self) -> u64 {
        match self {
            State::Idle { generation }
            | State::Connecting { generation, .. }
            | State::Connected { generation }
            | State::Aborting { generation, .. }
            | State::Disconnecting { generation }
            | State::Errored { generation, .. } => *generation,
        }
    }

    /// Externally visible state. An unwinding start still reads as Connecting
    /// so observers see Connecting -> Errored.
    pub fn public(&self) -> SessionState {
        match self {
            State::Idle { .. } => SessionState::Idle,
            State::Connecting { .. } | State::Aborting { .. } => SessionState::Connecting,
            State::Connected { .. } => SessionState::Connected,
            State::Disconnecting { .. } => SessionState::Disconnecting,
            State::Errored { .. } => SessionState::Errored,
        }
    }

    fn name(&self) -> &'static str {
        self.public().as_str()
    }
}

/// Events that can trigger state transitions.
/// Commands come from the controller API; the rest are completions and
/// notifications sent back by the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Stop,
    Reset,
    /// Controller is shutting down
    Exit,

    MicrophoneReady {
        generation: u64,
    },
    MicrophoneFailed {
        generation: u64,
        error: SessionError,
    },
    Connected {
        generation: u64,
    },
    ConnectFailed {
        generation: u64,
        error: SessionError,
    },
    TeardownDone {
        generation: u64,
    },

    // Room notifications (tagged with the generation whose subscription saw them)
    ConnectionLost {
        generation: u64,
        reason: String,
    },
    DeviceError {
        generation: u64,
        message: String,
    },

    /// "Session ended" display window has elapsed
    EndedWindowElapsed {
        generation: u64,
    },
}

impl Event {
    fn generation(&self) -> Option<u64> {
        match self {
            Event::MicrophoneReady { generation }
            | Event::MicrophoneFailed { generation, .. }
            | Event::Connected { generation }
            | Event::ConnectFailed { generation, .. }
            | Event::TeardownDone { generation }
            | Event::ConnectionLost { generation, .. }
            | Event::DeviceError { generation, .. }
            | Event::EndedWindowElapsed { generation } => Some(*generation),
            Event::Start | Event::Stop | Event::Reset | Event::Exit => None,
        }
    }
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Subscribe to room notifications for this generation
    WatchRoom {
        generation: u64,
    },
    EnableMicrophone {
        generation: u64,
    },
    /// Obtain connection details and open the room
    Connect {
        generation: u64,
    },
    /// Drop the room subscription, release the microphone and disconnect
    Teardown {
        generation: u64,
    },
    RefreshCredentials,
    StartEndedTimeout {
        generation: u64,
    },
    /// Broadcast a signal to subscribers (handled in the state loop)
    Notify(SessionSignal),
    /// Publish the public state (handled in the state loop)
    EmitUi,
}

/// Check a controller command against the current state before it is sent
/// to the reducer.
pub fn validate(state: &State, command: &Event) -> Result<(), SessionError> {
    let allowed = match command {
        Event::Start => matches!(state, State::Idle { .. }),
        Event::Stop => matches!(
            state,
            State::Connecting { .. }
                | State::Aborting { .. }
                | State::Connected { .. }
                | State::Errored { .. }
        ),
        Event::Reset => matches!(state, State::Errored { .. }),
        _ => true,
    };
    if allowed {
        return Ok(());
    }
    let operation = match command {
        Event::Start => "start",
        Event::Stop => "stop",
        Event::Reset => "reset",
        _ => "handle event",
    };
    Err(SessionError::InvalidState {
        operation,
        state: state.name(),
    })
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore completions with stale generations
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use State::*;

    // Device warnings are surfaced regardless of connection state
    if let Event::DeviceError { message, .. } = event {
        log::warn!("Media device error: {}", message);
        return (
            state.clone(),
            vec![Notify(SessionSignal::DeviceWarning { message })],
        );
    }

    let current = state.generation();
    if let Some(generation) = event.generation() {
        if generation != current {
            log::debug!(
                "Dropping stale {:?} (generation {} != {})",
                event,
                generation,
                current
            );
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle { generation }, Event::Start) => {
            let generation = generation + 1;
            (
                Connecting {
                    generation,
                    microphone_ready: false,
                    connected: false,
                },
                vec![
                    WatchRoom { generation },
                    EnableMicrophone { generation },
                    Connect { generation },
                    EmitUi,
                ],
            )
        }
        (Idle { generation }, Event::EndedWindowElapsed { .. }) => (
            Idle {
                generation: *generation,
            },
            vec![Notify(SessionSignal::SessionEndedWindowElapsed)],
        ),

        // -----------------
        // Connecting
        // -----------------
        (
            Connecting {
                generation,
                connected,
                ..
            },
            Event::MicrophoneReady { .. },
        ) => {
            if *connected {
                (
                    Connected {
                        generation: *generation,
                    },
                    vec![EmitUi],
                )
            } else {
                (
                    Connecting {
                        generation: *generation,
                        microphone_ready: true,
                        connected: false,
                    },
                    vec![],
                )
            }
        }
        (
            Connecting {
                generation,
                microphone_ready,
                ..
            },
            Event::Connected { .. },
        ) => {
            if *microphone_ready {
                (
                    Connected {
                        generation: *generation,
                    },
                    vec![EmitUi],
                )
            } else {
                (
                    Connecting {
                        generation: *generation,
                        microphone_ready: false,
                        connected: true,
                    },
                    vec![],
                )
            }
        }
        (Connecting { generation, .. }, Event::MicrophoneFailed { error, .. })
        | (Connecting { generation, .. }, Event::ConnectFailed { error, .. }) => {
            log::error!("Session start failed: {}", error);
            // Supersede the sibling sub-operation so a late success undoes itself
            let generation = generation + 1;
            (
                Aborting {
                    generation,
                    failure: StartFailure::classify(error),
                },
                vec![Teardown { generation }],
            )
        }
        (Connecting { generation, .. }, Event::Stop)
        | (Connected { generation }, Event::Stop)
        | (Errored { generation, .. }, Event::Stop) => {
            let generation = generation + 1;
            (
                Disconnecting { generation },
                vec![Teardown { generation }, EmitUi],
            )
        }
        (Connecting { generation, .. }, Event::ConnectionLost { reason, .. })
        | (Connected { generation }, Event::ConnectionLost { reason, .. }) => {
            log::warn!("Connection lost: {}", reason);
            let generation = generation + 1;
            (
                Idle { generation },
                vec![
                    Teardown { generation },
                    RefreshCredentials,
                    Notify(SessionSignal::SessionEnded),
                    StartEndedTimeout { generation },
                    EmitUi,
                ],
            )
        }

        // -----------------
        // Aborting
        // -----------------
        (Aborting { generation, failure }, Event::TeardownDone { .. }) => match failure {
            StartFailure::Credentials(error) => (
                Idle {
                    generation: *generation,
                },
                vec![
                    Notify(SessionSignal::StartFailed {
                        error: error.clone(),
                    }),
                    EmitUi,
                ],
            ),
            StartFailure::Fatal(error) => (
                Errored {
                    generation: *generation,
                    error: error.clone(),
                },
                vec![
                    Notify(SessionSignal::StartFailed {
                        error: error.clone(),
                    }),
                    EmitUi,
                ],
            ),
        },
        // Stop while unwinding: the teardown in flight already covers it
        (Aborting { generation, failure }, Event::Stop) => {
            log::info!(
                "Stop during failed start ({}), finishing teardown",
                failure.error()
            );
            (
                Disconnecting {
                    generation: *generation,
                },
                vec![EmitUi],
            )
        }

        // -----------------
        // Disconnecting
        // -----------------
        (Disconnecting { generation }, Event::TeardownDone { .. }) => (
            Idle {
                generation: *generation,
            },
            vec![EmitUi],
        ),

        // -----------------
        // Errored
        // -----------------
        (Errored { generation, .. }, Event::Reset) => (
            Idle {
                generation: *generation,
            },
            vec![EmitUi],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        (state, event) => {
            log::debug!("Ignoring {:?} in {}", event, state.name());
            (state.clone(), vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CredentialError;

    fn connecting(generation: u64) -> State {
        State::Connecting {
            generation,
            microphone_ready: false,
            connected: false,
        }
    }

    fn has_teardown(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Teardown { .. }))
    }

    #[test]
    fn idle_start_transitions_to_connecting() {
        let (next, effects) = reduce(&State::default(), Event::Start);
        assert!(matches!(next, State::Connecting { generation: 1, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EnableMicrophone { generation: 1 })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Connect { generation: 1 })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::WatchRoom { generation: 1 })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn connected_requires_both_sub_operations_in_either_order() {
        let (after_mic, _) = reduce(&connecting(1), Event::MicrophoneReady { generation: 1 });
        assert_eq!(after_mic.public(), SessionState::Connecting);
        let (done, _) = reduce(&after_mic, Event::Connected { generation: 1 });
        assert!(matches!(done, State::Connected { generation: 1 }));

        let (after_connect, _) = reduce(&connecting(1), Event::Connected { generation: 1 });
        assert_eq!(after_connect.public(), SessionState::Connecting);
        let (done, _) = reduce(&after_connect, Event::MicrophoneReady { generation: 1 });
        assert!(matches!(done, State::Connected { generation: 1 }));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let state = connecting(2);
        let (next, effects) = reduce(&state, Event::Connected { generation: 1 });
        assert!(matches!(
            next,
            State::Connecting {
                generation: 2,
                connected: false,
                ..
            }
        ));
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_during_connecting_supersedes_the_attempt() {
        let (next, effects) = reduce(&connecting(1), Event::Stop);
        assert!(matches!(next, State::Disconnecting { generation: 2 }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Teardown { generation: 2 })));

        // Late successes from generation 1 cannot resurrect the connection
        let (next, _) = reduce(&next, Event::Connected { generation: 1 });
        let (next, _) = reduce(&next, Event::MicrophoneReady { generation: 1 });
        assert!(matches!(next, State::Disconnecting { .. }));

        let (next, _) = reduce(&next, Event::TeardownDone { generation: 2 });
        assert!(matches!(next, State::Idle { generation: 2 }));
    }

    #[test]
    fn connect_failure_tears_down_before_errored() {
        let (next, effects) = reduce(
            &connecting(1),
            Event::ConnectFailed {
                generation: 1,
                error: SessionError::ConnectionFailed("refused".to_string()),
            },
        );
        assert!(matches!(next, State::Aborting { generation: 2, .. }));
        assert_eq!(next.public(), SessionState::Connecting);
        assert!(has_teardown(&effects));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Notify(_))));

        let (next, effects) = reduce(&next, Event::TeardownDone { generation: 2 });
        assert!(matches!(next, State::Errored { .. }));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(SessionSignal::StartFailed {
                error: SessionError::ConnectionFailed(_)
            })
        )));
    }

    #[test]
    fn credential_failure_returns_to_idle() {
        let error = SessionError::CredentialUnavailable(CredentialError::Network(
            "unreachable".to_string(),
        ));
        let (next, _) = reduce(
            &connecting(1),
            Event::ConnectFailed {
                generation: 1,
                error,
            },
        );
        let (next, effects) = reduce(&next, Event::TeardownDone { generation: 2 });
        assert!(matches!(next, State::Idle { generation: 2 }));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(SessionSignal::StartFailed {
                error: SessionError::CredentialUnavailable(_)
            })
        )));
    }

    #[test]
    fn microphone_failure_lands_in_errored_and_reset_returns_to_idle() {
        let (next, _) = reduce(
            &connecting(1),
            Event::MicrophoneFailed {
                generation: 1,
                error: SessionError::DeviceUnavailable("no input device".to_string()),
            },
        );
        let (errored, _) = reduce(&next, Event::TeardownDone { generation: 2 });
        assert_eq!(errored.public(), SessionState::Errored);

        assert!(validate(&errored, &Event::Start).is_err());
        let (idle, effects) = reduce(&errored, Event::Reset);
        assert!(matches!(idle, State::Idle { generation: 2 }));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn connection_lost_returns_to_idle_and_refreshes_credentials() {
        let state = State::Connected { generation: 3 };
        let (next, effects) = reduce(
            &state,
            Event::ConnectionLost {
                generation: 3,
                reason: "agent left".to_string(),
            },
        );
        assert!(matches!(next, State::Idle { generation: 4 }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RefreshCredentials)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(SessionSignal::SessionEnded))));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartEndedTimeout { generation: 4 })));

        let (_, effects) = reduce(&next, Event::EndedWindowElapsed { generation: 4 });
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(SessionSignal::SessionEndedWindowElapsed)
        )));
    }

    #[test]
    fn ended_window_from_previous_session_is_ignored() {
        let state = connecting(5);
        let (next, effects) = reduce(&state, Event::EndedWindowElapsed { generation: 4 });
        assert!(matches!(next, State::Connecting { generation: 5, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn device_error_warns_without_transition() {
        let state = State::Connected { generation: 1 };
        let (next, effects) = reduce(
            &state,
            Event::DeviceError {
                generation: 1,
                message: "microphone unplugged".to_string(),
            },
        );
        assert!(matches!(next, State::Connected { generation: 1 }));
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            &effects[0],
            Effect::Notify(SessionSignal::DeviceWarning { message }) if message == "microphone unplugged"
        ));
    }

    #[test]
    fn stop_while_aborting_keeps_generation() {
        let state = State::Aborting {
            generation: 2,
            failure: StartFailure::Fatal(SessionError::ConnectionFailed("x".to_string())),
        };
        let (next, effects) = reduce(&state, Event::Stop);
        assert!(matches!(next, State::Disconnecting { generation: 2 }));
        assert!(!has_teardown(&effects));
        let (next, _) = reduce(&next, Event::TeardownDone { generation: 2 });
        assert!(matches!(next, State::Idle { .. }));
    }

    #[test]
    fn commands_are_validated_against_state() {
        assert!(validate(&State::default(), &Event::Start).is_ok());
        assert!(matches!(
            validate(&State::default(), &Event::Stop),
            Err(SessionError::InvalidState {
                operation: "stop",
                state: "idle"
            })
        ));
        assert!(validate(&State::Connected { generation: 1 }, &Event::Start).is_err());
        assert!(validate(&State::Connected { generation: 1 }, &Event::Stop).is_ok());
        assert!(validate(&State::Disconnecting { generation: 1 }, &Event::Stop).is_err());
        assert!(validate(&State::default(), &Event::Reset).is_err());
    }
}
