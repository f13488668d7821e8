//! Session lifecycle and turn pipeline for voice-driven oral exam practice.
//!
//! Two flows share the audio and device layers:
//! - `session`: a real-time room connection driven by a reducer and a
//!   single-writer state loop.
//! - `pipeline`: turn-by-turn record, submit and reply against the
//!   conversation endpoint.

pub mod audio;
pub mod conversation;
pub mod countdown;
pub mod credentials;
pub mod effects;
pub mod error;
pub mod pipeline;
pub mod room;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod transport;

pub use conversation::{ConversationLog, ConversationProgress, ConversationTurn, Role};
pub use countdown::{format_remaining, StimulusCountdown};
pub use error::{
    AudioError, CredentialError, PlaybackError, SessionError, TransportError, TurnError,
};
pub use pipeline::{TurnOutcome, TurnPhase, TurnPipeline};
pub use session::{SessionController, SessionHandle, SessionSignal, SessionState};
pub use settings::ExamSettings;

/// Initialise `env_logger` at `info`, overridable through `RUST_LOG`.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
