//! Effect runner for the session controller
//!
//! This module executes effects produced by the session state machine against
//! the real-time room and the credential provider. Completion events are sent
//! back to the state loop tagged with the generation that requested them.
//!
//! The reducer drops stale completions, but a stale sub-operation may still
//! have succeeded (microphone on, room connected). The runner reads the
//! current generation from a shared atomic after each sub-operation and undoes
//! superseded successes itself. Room operations hold a shared lock and
//! teardown holds it exclusively, so a teardown never interleaves with a
//! half-finished connect.
//!
//! A teardown is registered as pending the moment it is spawned. New room
//! operations wait until no teardown is pending, so an old teardown can never
//! disconnect a link opened by a later start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::credentials::CredentialProvider;
use crate::error::{CredentialError, SessionError};
use crate::room::{RealtimeRoom, RoomEvent};
use crate::state_machine::{Effect, Event};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

fn is_current(current: &AtomicU64, generation: u64) -> bool {
    current.load(Ordering::SeqCst) == generation
}

/// Count of spawned teardowns that have not finished yet.
#[derive(Clone)]
struct PendingTeardowns(Arc<watch::Sender<usize>>);

impl PendingTeardowns {
    fn new() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }

    /// Register a teardown. The count drops when the guard does, even if
    /// the teardown task is cancelled.
    fn register(&self) -> TeardownGuard {
        self.0.send_modify(|pending| *pending += 1);
        TeardownGuard(self.clone())
    }

    fn count(&self) -> usize {
        *self.0.borrow()
    }

    async fn settled(&self) {
        let mut pending = self.0.subscribe();
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }
}

struct TeardownGuard(PendingTeardowns);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        (self.0).0.send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// Effect runner backed by a `RealtimeRoom`.
pub struct RoomEffectRunner {
    room: Arc<dyn RealtimeRoom>,
    credentials: Arc<dyn CredentialProvider>,
    /// Generation published by the state loop after every transition
    generation: Arc<AtomicU64>,
    room_ops: Arc<RwLock<()>>,
    teardowns: PendingTeardowns,
    /// Forwards room notifications for the current generation
    watcher: Mutex<Option<JoinHandle<()>>>,
    pre_connect_buffer: bool,
    ended_display: Duration,
}

impl RoomEffectRunner {
    pub fn new(
        room: Arc<dyn RealtimeRoom>,
        credentials: Arc<dyn CredentialProvider>,
        generation: Arc<AtomicU64>,
        pre_connect_buffer: bool,
        ended_display: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            room,
            credentials,
            generation,
            room_ops: Arc::new(RwLock::new(())),
            teardowns: PendingTeardowns::new(),
            watcher: Mutex::new(None),
            pre_connect_buffer,
            ended_display,
        })
    }

    fn replace_watcher(&self, next: Option<JoinHandle<()>>) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = watcher.take() {
            previous.abort();
        }
        *watcher = next;
    }
}

impl EffectRunner for RoomEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::WatchRoom { generation } => {
                // Subscribe before any connect runs so an early drop is not missed
                let mut events = self.room.subscribe();
                let task = tokio::spawn(async move {
                    loop {
                        let event = match events.recv().await {
                            Ok(RoomEvent::Disconnected { reason }) => {
                                Event::ConnectionLost { generation, reason }
                            }
                            Ok(RoomEvent::MediaDevicesError { message }) => {
                                Event::DeviceError { generation, message }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                log::warn!("Room watcher lagged, {} events skipped", skipped);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    log::debug!("Room watcher for generation {} exiting", generation);
                });
                self.replace_watcher(Some(task));
            }

            Effect::EnableMicrophone { generation } => {
                let room = self.room.clone();
                let current = self.generation.clone();
                let room_ops = self.room_ops.clone();
                let teardowns = self.teardowns.clone();
                let pre_connect_buffer = self.pre_connect_buffer;

                tokio::spawn(async move {
                    teardowns.settled().await;
                    let _ops = room_ops.read().await;
                    if !is_current(&current, generation) {
                        log::debug!("EnableMicrophone: generation {} superseded", generation);
                        return;
                    }

                    match room.set_microphone_enabled(true, pre_connect_buffer).await {
                        Ok(()) => {
                            if !is_current(&current, generation) {
                                log::info!(
                                    "Microphone came up for superseded generation {}, releasing",
                                    generation
                                );
                                if let Err(e) = room.set_microphone_enabled(false, false).await {
                                    log::warn!("Failed to release microphone: {}", e);
                                }
                                return;
                            }
                            let _ = tx.send(Event::MicrophoneReady { generation }).await;
                        }
                        Err(error) => {
                            log::error!("Failed to enable microphone: {}", error);
                            let _ = tx.send(Event::MicrophoneFailed { generation, error }).await;
                        }
                    }
                });
            }

            Effect::Connect { generation } => {
                let room = self.room.clone();
                let credentials = self.credentials.clone();
                let current = self.generation.clone();
                let room_ops = self.room_ops.clone();
                let teardowns = self.teardowns.clone();

                tokio::spawn(async move {
                    teardowns.settled().await;
                    let _ops = room_ops.read().await;
                    if !is_current(&current, generation) {
                        log::debug!("Connect: generation {} superseded", generation);
                        return;
                    }

                    let details = match credentials.existing_or_refresh().await {
                        Ok(details) if details.is_expired() => {
                            let error = CredentialError::Expired(details.expiry.to_rfc3339());
                            let _ = tx
                                .send(Event::ConnectFailed {
                                    generation,
                                    error: error.into(),
                                })
                                .await;
                            return;
                        }
                        Ok(details) => details,
                        Err(e) => {
                            log::error!("Connection details unavailable: {}", e);
                            let _ = tx
                                .send(Event::ConnectFailed {
                                    generation,
                                    error: SessionError::CredentialUnavailable(e),
                                })
                                .await;
                            return;
                        }
                    };

                    log::info!(
                        "Connecting to {} (details expire {})",
                        details.server_address,
                        details.expiry
                    );
                    match room.connect(&details).await {
                        Ok(()) => {
                            if !is_current(&current, generation) {
                                log::info!(
                                    "Connected for superseded generation {}, disconnecting",
                                    generation
                                );
                                room.disconnect().await;
                                return;
                            }
                            let _ = tx.send(Event::Connected { generation }).await;
                        }
                        Err(error) => {
                            log::error!("Failed to connect: {}", error);
                            let _ = tx.send(Event::ConnectFailed { generation, error }).await;
                        }
                    }
                });
            }

            Effect::Teardown { generation } => {
                // No room notification is forwarded past this point
                self.replace_watcher(None);

                let room = self.room.clone();
                let room_ops = self.room_ops.clone();
                let pending = self.teardowns.register();
                log::debug!(
                    "Teardown for generation {} registered ({} pending)",
                    generation,
                    self.teardowns.count()
                );
                tokio::spawn(async move {
                    let _pending = pending;
                    let _ops = room_ops.write().await;
                    if let Err(e) = room.set_microphone_enabled(false, false).await {
                        log::warn!("Teardown: failed to release microphone: {}", e);
                    }
                    room.disconnect().await;
                    log::debug!("Teardown complete for generation {}", generation);
                    let _ = tx.send(Event::TeardownDone { generation }).await;
                });
            }

            Effect::RefreshCredentials => {
                let credentials = self.credentials.clone();
                tokio::spawn(async move {
                    match credentials.refresh().await {
                        Ok(details) => log::info!(
                            "Connection details refreshed (expire {})",
                            details.expiry
                        ),
                        Err(e) => log::warn!("Failed to refresh connection details: {}", e),
                    }
                });
            }

            Effect::StartEndedTimeout { generation } => {
                let duration = self.ended_display;
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    log::debug!("Session ended window elapsed for generation {}", generation);
                    let _ = tx.send(Event::EndedWindowElapsed { generation }).await;
                });
            }

            Effect::Notify(_) | Effect::EmitUi => {
                log::error!("{:?} must be handled by the state loop", effect);
            }
        }
    }
}
