use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{broadcast, oneshot};

use speaksea_session::audio::{CpalInput, DeviceArbiter, SpeakerOutput, TurnPlayer};
use speaksea_session::credentials::{CachedCredentials, HttpCredentialSource};
use speaksea_session::room::WsRoom;
use speaksea_session::settings::{self, ExamSettings};
use speaksea_session::transport::HttpTurnTransport;
use speaksea_session::{
    format_remaining, init_logging, SessionController, SessionError, SessionHandle, SessionSignal,
    SessionState, StimulusCountdown, TransportError, TurnError, TurnOutcome, TurnPipeline,
};

#[derive(Parser)]
#[command(name = "speaksea-session")]
#[command(about = "Oral exam practice: real-time sessions and turn-based exams")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a real-time session; press Enter to leave
    Live,
    /// Watch the stimulus, then answer examiner turns with Enter
    Exam {
        /// Skip the stimulus countdown
        #[arg(long)]
        skip_stimulus: bool,
    },
    /// Write the settings file with every field filled in
    InitSettings,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Settings: {0}")]
    Settings(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type StdinLines = Lines<BufReader<Stdin>>;

fn main() -> ExitCode {
    // Silently ignore a missing .env; production uses system env vars
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = match cli.settings {
        Some(path) => path,
        None => settings::default_settings_path().map_err(CliError::Settings)?,
    };
    let mut exam_settings = settings::load_settings(&path);

    if let Commands::InitSettings = cli.command {
        return init_settings(&path, &exam_settings);
    }

    exam_settings.apply_env_overrides();
    log::info!("Settings loaded from {:?}", path);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Live => run_live(&exam_settings).await,
            Commands::Exam { skip_stimulus } => run_exam(&exam_settings, skip_stimulus).await,
            Commands::InitSettings => Ok(()),
        }
    })
}

/// Persist the file's settings, without environment overrides, so every
/// field is present for editing.
fn init_settings(path: &Path, exam_settings: &ExamSettings) -> Result<(), CliError> {
    settings::save_settings(path, exam_settings).map_err(CliError::Settings)?;
    println!("Settings written to {}", path.display());
    Ok(())
}

async fn next_line(lines: &mut StdinLines) -> Result<Option<String>, CliError> {
    Ok(lines.next_line().await?)
}

async fn run_live(settings: &ExamSettings) -> Result<(), CliError> {
    let devices = DeviceArbiter::new();
    let input = Arc::new(CpalInput::new());
    let room = Arc::new(WsRoom::new(
        input,
        devices.clone(),
        settings.pre_connect_buffer_secs,
    ));
    let credentials = Arc::new(CachedCredentials::new(HttpCredentialSource::new(
        reqwest::Client::new(),
        settings.connection_details_endpoint.clone(),
    )));

    let controller = SessionController::spawn(room, credentials, devices, settings);
    let mut signals = controller.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    controller.start().await?;
    println!("Connecting... press Enter to leave.");

    let result = loop {
        tokio::select! {
            line = next_line(&mut lines) => {
                if let Err(e) = line {
                    break Err(e);
                }
                break Ok(());
            }
            signal = signals.recv() => match signal {
                Ok(signal) => {
                    if report_signal(signal) {
                        break Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} session signals", n);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            }
        }
    };

    match controller.state() {
        SessionState::Connecting | SessionState::Connected | SessionState::Errored => {
            if let Err(e) = controller.stop().await {
                log::warn!("Stop on exit failed: {}", e);
            }
        }
        SessionState::Idle | SessionState::Disconnecting => {}
    }
    controller.shutdown().await;
    result
}

/// Print a session signal. Returns true when the live session is over.
fn report_signal(signal: SessionSignal) -> bool {
    match signal {
        SessionSignal::StateChanged(SessionState::Connected) => {
            println!("Connected. Please introduce yourself.");
            false
        }
        SessionSignal::StateChanged(state) => {
            println!("Session {}", state.as_str());
            false
        }
        SessionSignal::SessionEnded => {
            println!("Session ended.");
            false
        }
        SessionSignal::SessionEndedWindowElapsed => true,
        SessionSignal::DeviceWarning { message } => {
            eprintln!("Microphone problem: {}", message);
            false
        }
        SessionSignal::StartFailed { error } => {
            eprintln!("Could not start the session: {}", error);
            true
        }
    }
}

async fn run_exam(settings: &ExamSettings, skip_stimulus: bool) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if !skip_stimulus {
        watch_stimulus(settings, &mut lines).await?;
    }

    let devices = DeviceArbiter::new();
    let transport = Arc::new(HttpTurnTransport::with_timeout(
        settings.conversation_endpoint.clone(),
        settings.request_timeout(),
    )?);
    let player = TurnPlayer::new(Arc::new(SpeakerOutput::new()));
    let pipeline = TurnPipeline::new(
        Arc::new(CpalInput::new()),
        transport,
        player,
        SessionHandle::standalone(devices),
        settings,
    );

    for turn in pipeline.history() {
        println!("Examiner: {}", turn.text);
    }

    while !pipeline.progress().completed {
        println!("Press Enter to answer.");
        if next_line(&mut lines).await?.is_none() {
            break;
        }
        if let Err(e) = pipeline.begin_turn() {
            eprintln!("{}", e);
            continue;
        }

        println!("Recording... press Enter when you are done.");
        if next_line(&mut lines).await?.is_none() {
            pipeline.end_session();
            break;
        }

        let seen = pipeline.history().len();
        match pipeline.end_turn().await? {
            TurnOutcome::Replied {
                step_count,
                playback,
                ..
            } => {
                print_new_turns(&pipeline, seen);
                log::info!("Step {} of {}", step_count, settings.turn_limit);
                if let Some(playback) = playback {
                    // Failures are already logged by the player
                    let _ = playback.await;
                }
            }
            TurnOutcome::Apologised { .. } => print_new_turns(&pipeline, seen),
            TurnOutcome::Discarded => break,
        }
    }

    pipeline.end_session();
    println!("The exam is over. Thank you!");
    Ok(())
}

fn print_new_turns(pipeline: &TurnPipeline, seen: usize) {
    for turn in pipeline.history().iter().skip(seen) {
        let speaker = match turn.role {
            speaksea_session::Role::Examiner => "Examiner",
            speaksea_session::Role::Candidate => "You",
        };
        println!("{}: {}", speaker, turn.text);
    }
}

/// Show the stimulus countdown. Enter skips ahead.
async fn watch_stimulus(settings: &ExamSettings, lines: &mut StdinLines) -> Result<(), CliError> {
    let (entered_tx, mut entered) = oneshot::channel();
    let countdown = StimulusCountdown::start(settings.stimulus_countdown(), move || {
        let _ = entered_tx.send(());
    });
    let mut remaining = countdown.subscribe();

    println!(
        "Watch the video. The exam starts in {} (Enter to start now).",
        format_remaining(countdown.remaining())
    );

    loop {
        tokio::select! {
            _ = &mut entered => break,
            changed = remaining.changed() => {
                if changed.is_err() {
                    break;
                }
                let left = *remaining.borrow_and_update();
                if left > 0 && left % 30 == 0 {
                    println!("{} remaining", format_remaining(left));
                }
            }
            line = next_line(lines) => {
                line?;
                countdown.skip();
            }
        }
    }
    Ok(())
}
